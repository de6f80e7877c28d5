//! Foreign binding shim
//!
//! Flat C-callable surface over the sink layer. Sinks are held in a
//! global handle table keyed by monotonically increasing int64 handles;
//! 0 is the failure sentinel on create. Every exported function wraps its
//! body in a panic guard so a panic never crosses the ABI boundary: it is
//! logged and converted to the sentinel return instead.

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::media::BufferFlags;
use crate::sink::{KeyframeRequest, Sink};
use crate::whip::WhipSink;

struct HandleEntry {
    sink: Arc<dyn Sink>,
    /// Set when the handle is a WHIP sink, for the state getters.
    whip: Option<Arc<WhipSink>>,
}

static HANDLES: Lazy<RwLock<HashMap<i64, HandleEntry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));
static NEXT_HANDLE: AtomicI64 = AtomicI64::new(1);

/// Foreign-side keyframe trampoline: called with the handle whose sink
/// wants an encoder refresh.
pub type PliCallback = extern "C" fn(handle: i64);

struct PliTrampoline {
    handle: i64,
    callback: PliCallback,
}

impl KeyframeRequest for PliTrampoline {
    fn request_keyframe(&self) {
        (self.callback)(self.handle);
    }
}

fn guarded<T>(name: &str, sentinel: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            error!("panic caught in {}", name);
            sentinel
        }
    }
}

/// # Safety
/// `ptr` must be null or a valid NUL-terminated C string.
unsafe fn cstr<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

fn insert(sink: Arc<dyn Sink>, whip: Option<Arc<WhipSink>>) -> i64 {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::SeqCst);
    HANDLES.write().insert(handle, HandleEntry { sink, whip });
    handle
}

fn lookup(handle: i64) -> Option<Arc<dyn Sink>> {
    HANDLES.read().get(&handle).map(|entry| entry.sink.clone())
}

fn lookup_whip(handle: i64) -> Option<Arc<WhipSink>> {
    HANDLES.read().get(&handle).and_then(|entry| entry.whip.clone())
}

/// One-time process setup: installs the tracing subscriber. Safe to call
/// more than once.
#[no_mangle]
pub extern "C" fn uplink_init() {
    guarded("uplink_init", (), || {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .try_init();
        info!("uplink initialized");
    })
}

/// Create a sink from a JSON descriptor and a semicolon-joined MIME list.
/// Returns 0 on failure.
///
/// # Safety
/// Both pointers must be valid NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn uplink_sink_create(
    config_json: *const c_char,
    mime_types: *const c_char,
) -> i64 {
    guarded("uplink_sink_create", 0, || {
        let (Some(config), Some(mimes)) = (cstr(config_json), cstr(mime_types)) else {
            return 0;
        };
        match crate::sink::create_sink(config, mimes) {
            Ok(sink) => insert(sink, None),
            Err(e) => {
                warn!("sink create failed: {}", e);
                0
            }
        }
    })
}

/// # Safety
/// All pointers must be valid NUL-terminated C strings; `bearer_token`
/// may be null for no authentication.
#[no_mangle]
pub unsafe extern "C" fn uplink_whip_sink_create(
    url: *const c_char,
    bearer_token: *const c_char,
    mime_types: *const c_char,
) -> i64 {
    guarded("uplink_whip_sink_create", 0, || {
        let (Some(url), Some(mimes)) = (cstr(url), cstr(mime_types)) else {
            return 0;
        };
        let token = cstr(bearer_token).unwrap_or("");
        let tracks = match crate::media::parse_track_list(mimes) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("WHIP create failed: {}", e);
                return 0;
            }
        };
        match WhipSink::connect(url, token, &tracks) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                insert(sink.clone(), Some(sink))
            }
            Err(e) => {
                warn!("WHIP create failed: {}", e);
                0
            }
        }
    })
}

/// # Safety
/// Both pointers must be valid NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn uplink_srt_sink_create(
    url: *const c_char,
    mime_types: *const c_char,
) -> i64 {
    guarded("uplink_srt_sink_create", 0, || {
        let (Some(url), Some(mimes)) = (cstr(url), cstr(mime_types)) else {
            return 0;
        };
        let tracks = match crate::media::parse_track_list(mimes) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("SRT create failed: {}", e);
                return 0;
            }
        };
        match crate::srt::SrtSink::connect(url, &tracks) {
            Ok(sink) => insert(Arc::new(sink), None),
            Err(e) => {
                warn!("SRT create failed: {}", e);
                0
            }
        }
    })
}

/// # Safety
/// Both pointers must be valid NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn uplink_disk_sink_create(
    path: *const c_char,
    mime_types: *const c_char,
) -> i64 {
    guarded("uplink_disk_sink_create", 0, || {
        let (Some(path), Some(mimes)) = (cstr(path), cstr(mime_types)) else {
            return 0;
        };
        let tracks = match crate::media::parse_track_list(mimes) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("disk create failed: {}", e);
                return 0;
            }
        };
        match crate::sink::disk::DiskSink::create(path, &tracks) {
            Ok(sink) => insert(Arc::new(sink), None),
            Err(e) => {
                warn!("disk create failed: {}", e);
                0
            }
        }
    })
}

/// # Safety
/// Both pointers must be valid NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn uplink_rtsp_sink_create(
    path: *const c_char,
    port: u16,
    mime_types: *const c_char,
) -> i64 {
    guarded("uplink_rtsp_sink_create", 0, || {
        let (Some(path), Some(mimes)) = (cstr(path), cstr(mime_types)) else {
            return 0;
        };
        let tracks = match crate::media::parse_track_list(mimes) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("RTSP create failed: {}", e);
                return 0;
            }
        };
        let port = if port == 0 { 8554 } else { port };
        match crate::rtsp::RtspServerSink::start(path, port, &tracks) {
            Ok(sink) => insert(Arc::new(sink), None),
            Err(e) => {
                warn!("RTSP create failed: {}", e);
                0
            }
        }
    })
}

/// # Safety
/// Both pointers must be valid NUL-terminated C strings.
#[no_mangle]
pub unsafe extern "C" fn uplink_hls_sink_create(
    path: *const c_char,
    port: u16,
    mime_types: *const c_char,
) -> i64 {
    guarded("uplink_hls_sink_create", 0, || {
        let (Some(path), Some(mimes)) = (cstr(path), cstr(mime_types)) else {
            return 0;
        };
        let tracks = match crate::media::parse_track_list(mimes) {
            Ok(tracks) => tracks,
            Err(e) => {
                warn!("HLS create failed: {}", e);
                return 0;
            }
        };
        let port = if port == 0 { 8080 } else { port };
        match crate::hls::HlsSink::start(path, port, &tracks) {
            Ok(sink) => insert(Arc::new(sink), None),
            Err(e) => {
                warn!("HLS create failed: {}", e);
                0
            }
        }
    })
}

/// Write one sample. Returns 1 when the sink requests a keyframe, 0
/// otherwise (including on error, which is logged).
///
/// # Safety
/// `data` must point to at least `length` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn uplink_sink_write_sample(
    handle: i64,
    track: i32,
    data: *const u8,
    length: i32,
    pts_us: i64,
    flags: i32,
) -> i32 {
    guarded("uplink_sink_write_sample", 0, || {
        let Some(sink) = lookup(handle) else {
            return 0;
        };
        if data.is_null() || length < 0 || track < 0 {
            return 0;
        }
        let buf = std::slice::from_raw_parts(data, length as usize);
        match sink.write_sample(track as usize, buf, pts_us, BufferFlags(flags as u32)) {
            Ok(true) => 1,
            Ok(false) => 0,
            Err(e) => {
                warn!("write_sample failed: {}", e);
                0
            }
        }
    })
}

/// Close and release a handle. The sink's close runs under the write
/// lock so no writer can race the release.
#[no_mangle]
pub extern "C" fn uplink_sink_close(handle: i64) {
    guarded("uplink_sink_close", (), || {
        let mut handles = HANDLES.write();
        if let Some(entry) = handles.remove(&handle) {
            if let Err(e) = entry.sink.close() {
                warn!("close failed for handle {}: {}", handle, e);
            }
        }
    })
}

/// Congestion-derived bitrate target in bits per second; 0 when the sink
/// has no estimator or the handle is unknown.
#[no_mangle]
pub extern "C" fn uplink_sink_bandwidth_estimate(handle: i64) -> i64 {
    guarded("uplink_sink_bandwidth_estimate", 0, || {
        lookup(handle)
            .and_then(|sink| sink.bandwidth_estimate())
            .unwrap_or(0)
    })
}

/// Register the PLI trampoline for a handle. The callback is invoked with
/// the same handle whenever the sink wants a keyframe.
#[no_mangle]
pub extern "C" fn uplink_sink_set_pli_callback(handle: i64, callback: Option<PliCallback>) {
    guarded("uplink_sink_set_pli_callback", (), || {
        let (Some(sink), Some(callback)) = (lookup(handle), callback) else {
            return;
        };
        sink.set_keyframe_callback(Arc::new(PliTrampoline { handle, callback }));
    })
}

fn state_string(value: Option<String>) -> *mut c_char {
    let text = value.unwrap_or_else(|| "unknown".to_string());
    CString::new(text)
        .unwrap_or_default()
        .into_raw()
}

/// ICE connection state of a WHIP handle. Returns a heap string that must
/// be released with `uplink_string_free`.
#[no_mangle]
pub extern "C" fn uplink_whip_ice_connection_state(handle: i64) -> *mut c_char {
    guarded("uplink_whip_ice_connection_state", std::ptr::null_mut(), || {
        state_string(lookup_whip(handle).map(|sink| sink.ice_connection_state()))
    })
}

/// Peer connection state of a WHIP handle. Returns a heap string that
/// must be released with `uplink_string_free`.
#[no_mangle]
pub extern "C" fn uplink_whip_peer_connection_state(handle: i64) -> *mut c_char {
    guarded("uplink_whip_peer_connection_state", std::ptr::null_mut(), || {
        state_string(lookup_whip(handle).map(|sink| sink.peer_connection_state()))
    })
}

/// # Safety
/// `ptr` must have been returned by one of the state getters and not yet
/// freed.
#[no_mangle]
pub unsafe extern "C" fn uplink_string_free(ptr: *mut c_char) {
    guarded("uplink_string_free", (), || {
        if !ptr.is_null() {
            drop(CString::from_raw(ptr));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn c(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn disk_sink_round_trip_through_the_abi() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = c(dir.path().to_str().unwrap());
        let mimes = c("video/avc");

        let handle = unsafe { uplink_disk_sink_create(path.as_ptr(), mimes.as_ptr()) };
        assert!(handle > 0);

        let frame = [0u8, 0, 0, 1, 0x65, 0x01];
        let wrote = unsafe {
            uplink_sink_write_sample(handle, 0, frame.as_ptr(), frame.len() as i32, 1000, 1)
        };
        assert_eq!(wrote, 0);

        uplink_sink_close(handle);
        // Handle is gone after close.
        let wrote = unsafe {
            uplink_sink_write_sample(handle, 0, frame.as_ptr(), frame.len() as i32, 2000, 1)
        };
        assert_eq!(wrote, 0);
    }

    #[test]
    fn create_failures_return_zero() {
        let bad_json = c("{not json");
        let mimes = c("video/avc");
        let handle = unsafe { uplink_sink_create(bad_json.as_ptr(), mimes.as_ptr()) };
        assert_eq!(handle, 0);

        let handle = unsafe { uplink_sink_create(std::ptr::null(), mimes.as_ptr()) };
        assert_eq!(handle, 0);
    }

    #[test]
    fn unknown_handles_are_harmless() {
        assert_eq!(uplink_sink_bandwidth_estimate(987_654), 0);
        uplink_sink_close(987_654);
        let state = uplink_whip_ice_connection_state(987_654);
        let text = unsafe { CStr::from_ptr(state) }.to_str().unwrap().to_string();
        assert_eq!(text, "unknown");
        unsafe { uplink_string_free(state) };
    }
}
