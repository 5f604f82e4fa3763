//! Threat identity derivation
//!
//! Maps heterogeneous detection signals onto canonical threat ids so the
//! threat manager can merge related signals into one active threat. The rules
//! are applied in a fixed order:
//!
//! 1. false-positive patterns never become threats,
//! 2. Telegram-related signals group by `telegram:{pid}` (or `telegram`),
//! 3. interpreter families collapse to canonical tokens,
//! 4. the first executable token found in name or details becomes the id,
//! 5. known tool display names map through a dictionary,
//! 6. fallback: first non-generic word of the lowercased name.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{Category, Signal, Status};

/// Generic name prefixes skipped by the first-word fallback.
const GENERIC_PREFIXES: [&str; 5] = ["suspicious", "compiled", "unsigned", "obfuscated", "protected"];

/// Known bot engines that escalate ALERT signals to CRITICAL.
const KNOWN_BOT_TOKENS: [&str; 5] = ["warbot", "holdembot", "shanky", "openholdem", "pokerbotai"];

/// Known real-time-assistance tools that escalate ALERT signals to CRITICAL.
const KNOWN_RTA_TOKENS: [&str; 3] = ["gto wizard", "gtowizard", "rta.poker"];

/// Display-name → canonical id dictionary for tools without an `.exe` token.
const KNOWN_TOOLS: [(&str, &str); 7] = [
    ("openholdem", "openholdem"),
    ("warbot", "warbot"),
    ("shankybot", "shankybot"),
    ("pokerbotai", "pokerbotai"),
    ("gto wizard", "gtowizard"),
    ("holdem manager", "holdemmanager"),
    ("pokertracker", "pokertracker"),
];

fn pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"pid[=:]\s*(\d+)").unwrap_or_else(|_| unreachable!()))
}

fn exe_patterns() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r":\s*([a-zA-Z0-9_\-]+\.exe)",
            r"^([a-zA-Z0-9_\-]+\.exe)",
            r"\b([a-zA-Z0-9_\-]+\.exe)\b",
            r"proc[=:]\s*(\w+)",
            r"process[=:]\s*(\w+)",
            r"pid[=:]\s*\d+.*?([a-zA-Z0-9_\-]+\.exe)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Collapse interpreter process names onto their family token.
fn canonical_interpreter(stem: &str) -> &str {
    match stem {
        "python" | "pythonw" | "python3" => "python",
        "autohotkey" | "ahk" => "autohotkey",
        "autoit3" => "autoit",
        other => other,
    }
}

/// Derive the canonical threat id for a signal.
///
/// Identity is stable: the same signal content always yields the same id.
pub fn derive_threat_id(signal: &Signal) -> String {
    let name_lower = signal.name.to_lowercase();
    let details_lower = signal.details.to_lowercase();

    // Telegram activity groups together regardless of which segment saw it,
    // per-process when a PID is visible.
    if name_lower.contains("telegram") || details_lower.contains("telegram") {
        if let Some(caps) = pid_re().captures(&details_lower) {
            return format!("telegram:{}", &caps[1]);
        }
        return "telegram".to_string();
    }

    // Node spawns many helper processes; normalize before regex extraction.
    if name_lower.contains("node.exe")
        || name_lower.contains("node.js")
        || name_lower.starts_with("node")
        || details_lower.contains("node.exe")
    {
        return "node".to_string();
    }

    // "Prefix: something.exe" - the stem after the colon is the id.
    if let Some((_, tail)) = name_lower.split_once(':') {
        let candidate = tail.trim();
        if let Some(stem) = candidate.strip_suffix(".exe") {
            return canonical_interpreter(stem).to_string();
        }
    }

    // First executable token anywhere in name or details.
    for pattern in exe_patterns() {
        for src in [&name_lower, &details_lower] {
            if let Some(caps) = pattern.captures(src) {
                let stem = caps[1].trim_end_matches(".exe");
                return canonical_interpreter(stem).to_string();
            }
        }
    }

    // Known tools announced by display name only.
    for (token, id) in KNOWN_TOOLS {
        if name_lower.contains(token) {
            return id.to_string();
        }
    }

    // Interpreter families announced without an executable token.
    if name_lower.contains("python") {
        return "python".to_string();
    }
    if name_lower.contains("autohotkey") || name_lower.contains("ahk") {
        return "autohotkey".to_string();
    }
    if name_lower.contains("autoit") {
        return "autoit".to_string();
    }
    if name_lower.contains("powershell") {
        return "powershell".to_string();
    }
    if name_lower.contains("discord") {
        return "discord".to_string();
    }

    // Fallback: first word, skipping generic prefixes when a second word exists.
    let mut words = name_lower.split_whitespace();
    let first = words.next().unwrap_or("unknown");
    if GENERIC_PREFIXES.contains(&first) {
        if let Some(second) = words.next() {
            return second.to_string();
        }
    }
    first.to_string()
}

/// Signals that must never be tracked as threats.
///
/// Covers legitimate Windows system processes, well-known desktop apps in
/// their normal install locations, the protected client running normally,
/// and informational status traffic.
pub fn is_false_positive(signal: &Signal) -> bool {
    let name_lower = signal.name.to_lowercase();
    let details_lower = signal.details.to_lowercase();

    const SYSTEM_PROCESSES: [&str; 6] = [
        "svchost.exe",
        "conhost.exe",
        "taskhostw.exe",
        "audiodg.exe",
        "phoneexperiencehost.exe",
        "runtimebroker.exe",
    ];

    if SYSTEM_PROCESSES.iter().any(|p| name_lower.contains(p)) {
        return true;
    }
    if name_lower.contains("slack.exe") && details_lower.contains("app") {
        return true;
    }
    if name_lower.contains("teams.exe") && details_lower.contains("appdata") {
        return true;
    }
    if name_lower.contains("discord.exe") && details_lower.contains("local") {
        return true;
    }
    if details_lower.contains(".mui")
        && ["svchost", "conhost", "taskhostw"]
            .iter()
            .any(|p| name_lower.contains(p))
    {
        return true;
    }
    // Protected client running normally is not a threat.
    if name_lower.contains("protected site: coinpoker") {
        return true;
    }
    if name_lower.contains("coinpoker") && details_lower.contains("running normally") {
        return true;
    }
    if signal.status == Status::Info
        && (name_lower.contains("other poker site:") || name_lower.contains("input source:"))
    {
        return true;
    }
    if signal.status == Status::Ok {
        return true;
    }
    if name_lower.contains("threat summary") {
        return true;
    }
    if signal.category == Category::System && signal.status == Status::Info {
        return true;
    }

    false
}

/// Unified threat level for a signal (first matching rule wins).
pub fn threat_level(signal: &Signal) -> Status {
    let name_lower = signal.name.to_lowercase();
    let details_lower = signal.details.to_lowercase();

    if signal.status == Status::Critical {
        return Status::Critical;
    }

    if signal.status == Status::Alert {
        if KNOWN_BOT_TOKENS.iter().any(|b| name_lower.contains(b))
            || KNOWN_RTA_TOKENS.iter().any(|r| name_lower.contains(r))
        {
            return Status::Critical;
        }
        if name_lower.contains("bot token") || details_lower.contains("bot token") {
            return Status::Critical;
        }
        return Status::Alert;
    }

    if signal.status == Status::Warn {
        // Automation or virtualization while the protected client runs.
        if signal.category == Category::Auto
            || name_lower.contains("python")
            || name_lower.contains("autohotkey")
        {
            return Status::Alert;
        }
        if signal.category == Category::Vm {
            return Status::Alert;
        }
        return Status::Warn;
    }

    Status::Info
}

/// Whether `new_name` is a strictly more specific description than
/// `current_name`. Executable tokens beat generic prefixes; otherwise the
/// longer name wins.
pub fn is_more_specific_name(new_name: &str, current_name: &str) -> bool {
    let new_lower = new_name.to_lowercase();
    let current_lower = current_name.to_lowercase();

    for prefix in GENERIC_PREFIXES {
        if current_lower.starts_with(prefix) && new_lower.contains(".exe") {
            return true;
        }
    }
    if new_lower.contains(".exe") && !current_lower.contains(".exe") {
        return true;
    }
    new_name.len() > current_name.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(category: Category, name: &str, status: Status, details: &str) -> Signal {
        Signal::new(category, name, status, details)
    }

    #[test]
    fn test_telegram_grouping_with_and_without_pid() {
        let with_pid = signal(
            Category::Network,
            "Telegram Activity",
            Status::Alert,
            "pid=4242 | chat session open",
        );
        assert_eq!(derive_threat_id(&with_pid), "telegram:4242");

        let without_pid = signal(
            Category::Network,
            "CoinPoker RTA Risk",
            Status::Alert,
            "telegram traffic observed",
        );
        assert_eq!(derive_threat_id(&without_pid), "telegram");
    }

    #[test]
    fn test_exe_stem_extracted_from_prefixed_name() {
        let sig = signal(
            Category::Programs,
            "Suspicious Code: openholdem.exe",
            Status::Warn,
            "",
        );
        assert_eq!(derive_threat_id(&sig), "openholdem");

        let entropy = signal(
            Category::Programs,
            "Suspicious Entropy: weatherzeroservice.exe",
            Status::Warn,
            "",
        );
        assert_eq!(derive_threat_id(&entropy), "weatherzeroservice");
    }

    #[test]
    fn test_interpreter_families_collapse() {
        for (name, expected) in [
            ("Process: pythonw.exe", "python"),
            ("Process: python3.exe", "python"),
            ("Process: autoit3.exe", "autoit"),
            ("Python", "python"),
            ("AutoHotkey Macro", "autohotkey"),
            ("PowerShell Script Host", "powershell"),
        ] {
            let sig = signal(Category::Auto, name, Status::Warn, "");
            assert_eq!(derive_threat_id(&sig), expected, "name: {name}");
        }
    }

    #[test]
    fn test_known_tool_dictionary() {
        let sig = signal(Category::Auto, "OpenHoldem", Status::Alert, "");
        assert_eq!(derive_threat_id(&sig), "openholdem");

        let gto = signal(Category::Screen, "GTO Wizard Overlay", Status::Alert, "");
        assert_eq!(derive_threat_id(&gto), "gtowizard");
    }

    #[test]
    fn test_fallback_skips_generic_prefixes() {
        let sig = signal(Category::Programs, "Unsigned Binary Found", Status::Warn, "");
        assert_eq!(derive_threat_id(&sig), "binary");

        let bare = signal(Category::Programs, "Suspicious", Status::Warn, "");
        assert_eq!(derive_threat_id(&bare), "suspicious");
    }

    #[test]
    fn test_identity_is_stable() {
        let sig = signal(
            Category::Programs,
            "Suspicious Code: bot.exe",
            Status::Warn,
            "entropy 7.9",
        );
        assert_eq!(derive_threat_id(&sig), derive_threat_id(&sig.clone()));
    }

    #[test]
    fn test_false_positive_patterns() {
        assert!(is_false_positive(&signal(
            Category::Programs,
            "Renamed Process: svchost.exe",
            Status::Warn,
            ""
        )));
        assert!(is_false_positive(&signal(
            Category::Programs,
            "Protected Site: CoinPoker",
            Status::Info,
            ""
        )));
        assert!(is_false_positive(&signal(
            Category::System,
            "Scanner Started",
            Status::Info,
            ""
        )));
        assert!(is_false_positive(&signal(
            Category::Programs,
            "Anything",
            Status::Ok,
            ""
        )));
        assert!(!is_false_positive(&signal(
            Category::Auto,
            "Python",
            Status::Warn,
            "Python detected"
        )));
    }

    #[test]
    fn test_threat_level_mapping() {
        // CRITICAL passes through
        assert_eq!(
            threat_level(&signal(Category::Programs, "X", Status::Critical, "")),
            Status::Critical
        );
        // ALERT + known bot token escalates
        assert_eq!(
            threat_level(&signal(Category::Auto, "OpenHoldem", Status::Alert, "")),
            Status::Critical
        );
        // ALERT + bot-token pattern in details escalates
        assert_eq!(
            threat_level(&signal(
                Category::Network,
                "Messaging Session",
                Status::Alert,
                "bot token 123456:AAF observed"
            )),
            Status::Critical
        );
        // Plain ALERT stays ALERT
        assert_eq!(
            threat_level(&signal(Category::Network, "RDP Session", Status::Alert, "")),
            Status::Alert
        );
        // WARN in auto escalates to ALERT
        assert_eq!(
            threat_level(&signal(Category::Auto, "Macro Replay", Status::Warn, "")),
            Status::Alert
        );
        // WARN naming python escalates even outside auto
        assert_eq!(
            threat_level(&signal(Category::Programs, "Python Runtime", Status::Warn, "")),
            Status::Alert
        );
        // WARN in vm escalates
        assert_eq!(
            threat_level(&signal(Category::Vm, "Hypervisor Bit", Status::Warn, "")),
            Status::Alert
        );
        // Plain WARN stays WARN
        assert_eq!(
            threat_level(&signal(Category::Programs, "Odd Binary", Status::Warn, "")),
            Status::Warn
        );
        // Everything else is INFO
        assert_eq!(
            threat_level(&signal(Category::Programs, "Seen", Status::Info, "")),
            Status::Info
        );
    }

    #[test]
    fn test_more_specific_name() {
        assert!(is_more_specific_name(
            "Suspicious Code: bot.exe",
            "Suspicious Entropy"
        ));
        assert!(is_more_specific_name("bot.exe detected", "Automation tool"));
        assert!(!is_more_specific_name("Python", "Python Automation Runtime"));
        // Longer wins among equally specific names
        assert!(is_more_specific_name(
            "Python Automation Runtime",
            "Python"
        ));
    }
}
