//! Public IP and geolocation lookup
//!
//! Best-effort probe used once at pipeline start: the public address goes
//! into batch identity (`device_ip`), the location only into a log line.
//! Failures accumulate into `error` - the agent never depends on this
//! succeeding.

use std::time::Duration;

use serde::Deserialize;

/// Public network metadata for this workstation.
#[derive(Debug, Clone, Default)]
pub struct PublicIpInfo {
    pub ip: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpifyResponse {
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    city: Option<String>,
    region: Option<String>,
    country_name: Option<String>,
    country: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// Retrieve public IP and geolocation metadata.
pub async fn public_ip_info(timeout: Duration) -> PublicIpInfo {
    let mut info = PublicIpInfo::default();
    let mut errors: Vec<String> = Vec::new();

    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            info.error = Some(format!("http client: {e}"));
            return info;
        }
    };

    match client
        .get("https://api.ipify.org")
        .query(&[("format", "json")])
        .send()
        .await
    {
        Ok(response) => match response.json::<IpifyResponse>().await {
            Ok(body) if body.ip.is_some() => info.ip = body.ip,
            Ok(_) => errors.push("IP service did not return an address".to_string()),
            Err(e) => errors.push(format!("IP lookup failed: {e}")),
        },
        Err(e) => errors.push(format!("IP lookup failed: {e}")),
    }

    if let Some(ip) = info.ip.clone() {
        match client
            .get(format!("https://ipapi.co/{ip}/json/"))
            .send()
            .await
        {
            Ok(response) => match response.json::<GeoResponse>().await {
                Ok(geo) => {
                    info.city = geo.city;
                    info.region = geo.region;
                    info.country = geo.country_name.or(geo.country);
                    info.latitude = geo.latitude;
                    info.longitude = geo.longitude;
                }
                Err(e) => errors.push(format!("Geo lookup failed: {e}")),
            },
            Err(e) => errors.push(format!("Geo lookup failed: {e}")),
        }
    }

    if !errors.is_empty() {
        info.error = Some(errors.join("; "));
    }
    info
}

/// One-line description for the startup log.
pub fn format_public_ip_log(info: &PublicIpInfo) -> String {
    match &info.ip {
        Some(ip) => {
            let location: Vec<&str> = [&info.city, &info.region, &info.country]
                .into_iter()
                .filter_map(|p| p.as_deref())
                .collect();
            let location = if location.is_empty() {
                "Location unavailable".to_string()
            } else {
                location.join(", ")
            };
            let coords = match (info.latitude, info.longitude) {
                (Some(lat), Some(lon)) => format!(" (lat {lat}, lon {lon})"),
                _ => String::new(),
            };
            format!("Public IP: {ip} - {location}{coords}")
        }
        None => format!(
            "Public IP lookup failed: {}",
            info.error.as_deref().unwrap_or("Lookup unavailable")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_line_with_full_info() {
        let info = PublicIpInfo {
            ip: Some("203.0.113.9".to_string()),
            city: Some("Stockholm".to_string()),
            region: None,
            country: Some("Sweden".to_string()),
            latitude: Some(59.3),
            longitude: Some(18.1),
            error: None,
        };
        assert_eq!(
            format_public_ip_log(&info),
            "Public IP: 203.0.113.9 - Stockholm, Sweden (lat 59.3, lon 18.1)"
        );
    }

    #[test]
    fn test_log_line_without_ip() {
        let info = PublicIpInfo {
            error: Some("IP lookup failed: timeout".to_string()),
            ..Default::default()
        };
        assert_eq!(
            format_public_ip_log(&info),
            "Public IP lookup failed: IP lookup failed: timeout"
        );
    }
}
