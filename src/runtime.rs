//! Shared tokio runtime
//!
//! Sinks expose a synchronous `write_sample` surface that may be called from
//! any producer thread, while the protocol stacks underneath (WebRTC, SRT,
//! HTTP, RTSP) are async. All of them run on this single multi-threaded
//! runtime; synchronous entry points bridge in with `block_on`.

use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("uplink-io")
        .enable_all()
        .build()
        .expect("failed to build uplink runtime")
});

/// Handle to the shared runtime.
pub(crate) fn handle() -> &'static Runtime {
    &RUNTIME
}

/// Run a future to completion on the shared runtime from a sync context.
///
/// Must not be called from within the runtime itself; sink entry points are
/// always plain threads (producer or FFI), so this holds by construction.
pub(crate) fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    RUNTIME.block_on(fut)
}
