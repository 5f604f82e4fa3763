//! Win32 window backend
//!
//! Window enumeration and screenshot capture for [`SystemHost`] on Windows.
//! Capture uses `PrintWindow` with full-content rendering so hardware-
//! accelerated table windows (the client renders through Qt/ANGLE) come out
//! non-black, then reads the bitmap back through `GetDIBits` and encodes it
//! as PNG.
//!
//! [`SystemHost`]: super::SystemHost

#![allow(unsafe_code)]

use std::io::Cursor;

use windows_sys::Win32::Foundation::{HWND, LPARAM, RECT};
use windows_sys::Win32::Graphics::Gdi::{
    CreateCompatibleBitmap, CreateCompatibleDC, DeleteDC, DeleteObject, GetDIBits, GetWindowDC,
    ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, DIB_RGB_COLORS,
};
use windows_sys::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetClassNameW, GetWindowRect, GetWindowTextW, GetWindowThreadProcessId,
    IsWindowVisible, PrintWindow,
};

use super::{HostError, WindowInfo};

/// `PrintWindow` flag: render the full window content including DX surfaces.
const PW_RENDERFULLCONTENT: u32 = 2;

fn utf16_to_string(buf: &[u16], len: i32) -> String {
    if len <= 0 {
        return String::new();
    }
    String::from_utf16_lossy(&buf[..len as usize])
}

/// Enumerate all top-level windows.
pub fn enumerate_windows() -> Vec<WindowInfo> {
    unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> i32 {
        let out = &mut *(lparam as *mut Vec<WindowInfo>);

        let mut class_buf = [0u16; 256];
        let class_len = GetClassNameW(hwnd, class_buf.as_mut_ptr(), class_buf.len() as i32);

        let mut title_buf = [0u16; 512];
        let title_len = GetWindowTextW(hwnd, title_buf.as_mut_ptr(), title_buf.len() as i32);

        let mut pid: u32 = 0;
        GetWindowThreadProcessId(hwnd, &mut pid);

        let mut rect = RECT {
            left: 0,
            top: 0,
            right: 0,
            bottom: 0,
        };
        GetWindowRect(hwnd, &mut rect);

        out.push(WindowInfo {
            handle: hwnd as u64,
            pid,
            class_name: utf16_to_string(&class_buf, class_len),
            title: utf16_to_string(&title_buf, title_len),
            visible: IsWindowVisible(hwnd) != 0,
            rect: (rect.left, rect.top, rect.right, rect.bottom),
        });
        1
    }

    let mut windows: Vec<WindowInfo> = Vec::new();
    unsafe {
        EnumWindows(Some(enum_proc), &mut windows as *mut Vec<WindowInfo> as LPARAM);
    }
    windows
}

/// Capture one window as a PNG byte buffer.
pub fn capture_window_png(handle: u64) -> Result<Vec<u8>, HostError> {
    let hwnd = handle as HWND;

    let mut rect = RECT {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };
    // SAFETY: plain FFI calls on a window handle; a dead handle just fails.
    unsafe {
        if GetWindowRect(hwnd, &mut rect) == 0 {
            return Err(HostError::CaptureUnavailable(format!(
                "window {handle} has no rect (closed?)"
            )));
        }
    }
    let width = rect.right - rect.left;
    let height = rect.bottom - rect.top;
    if width <= 0 || height <= 0 {
        return Err(HostError::CaptureUnavailable(format!(
            "window {handle} has zero area"
        )));
    }

    let mut pixels = vec![0u8; (width as usize) * (height as usize) * 4];
    unsafe {
        let window_dc = GetWindowDC(hwnd);
        if window_dc == 0 {
            return Err(HostError::CaptureUnavailable("GetWindowDC failed".to_string()));
        }
        let mem_dc = CreateCompatibleDC(window_dc);
        let bitmap = CreateCompatibleBitmap(window_dc, width, height);
        let previous = SelectObject(mem_dc, bitmap);

        let printed = PrintWindow(hwnd, mem_dc, PW_RENDERFULLCONTENT);

        let mut info: BITMAPINFO = std::mem::zeroed();
        info.bmiHeader = BITMAPINFOHEADER {
            biSize: std::mem::size_of::<BITMAPINFOHEADER>() as u32,
            biWidth: width,
            // Negative height: top-down rows, matching the image buffer
            biHeight: -height,
            biPlanes: 1,
            biBitCount: 32,
            biCompression: BI_RGB as u32,
            biSizeImage: 0,
            biXPelsPerMeter: 0,
            biYPelsPerMeter: 0,
            biClrUsed: 0,
            biClrImportant: 0,
        };
        let copied = GetDIBits(
            mem_dc,
            bitmap,
            0,
            height as u32,
            pixels.as_mut_ptr().cast(),
            &mut info,
            DIB_RGB_COLORS,
        );

        SelectObject(mem_dc, previous);
        DeleteObject(bitmap);
        DeleteDC(mem_dc);
        ReleaseDC(hwnd, window_dc);

        if printed == 0 || copied == 0 {
            return Err(HostError::CaptureUnavailable(
                "window contents could not be rendered".to_string(),
            ));
        }
    }

    // GDI hands back BGRA with an unused alpha channel
    for px in pixels.chunks_exact_mut(4) {
        px.swap(0, 2);
        px[3] = 0xFF;
    }

    let img = image::RgbaImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        HostError::CaptureUnavailable("bitmap size mismatch".to_string())
    })?;
    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| HostError::CaptureUnavailable(format!("png encode: {e}")))?;
    Ok(png)
}
