#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! Test attribute for relaio.

mod entry;
mod parse;

/// Runs a test with the current thread attached as a backend of a freshly
/// built `Aio` subsystem, whose relation files live in a temporary data
/// directory.
///
/// The test may take a `&relaio::Aio` argument to reach the subsystem.
///
/// ```no_run
/// #[relaio::test(io_method = "worker", io_workers = 2)]
/// fn reads_blocks(aio: &relaio::Aio) -> anyhow::Result<()> {
///     assert_eq!(aio.num_attached(), 3);
///     Ok(())
/// }
/// ```
///
/// # Options
///
/// - `io_method`: `"sync"`, `"worker"` (default) or `"io_uring"`.
/// - `max_concurrency`: handles per backend.
/// - `io_workers`: IO worker threads, requires the worker method.
/// - `shared_buffers`: size of the shared buffer pool.
///
/// Tests using the io_uring method are skipped when the kernel refuses to
/// set up a ring.
///
/// The expansion refers to `tempfile` and `tracing_subscriber`, both must be
/// available to the test crate.
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
