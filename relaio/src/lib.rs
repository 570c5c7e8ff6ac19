//! Asynchronous block IO for relation files.
//!
//! Backends are threads attached to an [`Aio`] subsystem. Each owns a range
//! of IO handles in a shared pool, starts reads and writes on them and gets
//! their outcome through completion callbacks, no matter which thread ended
//! up executing the IO. Buffer reads and read streams build on top.

#[doc(inline)]
pub use relaio_macros::test;

// Lets `#[relaio::test]` refer to `::relaio` from inside this crate.
extern crate self as relaio;

pub mod aio;
pub use aio::{
    Aio, AioError, BackendGuard, CallbackId, CallbackOps, IoHandle, ResourceOwner, WaitRef,
};

pub mod buffer;

mod config;
pub use config::{AioConfig, Builder, MAX_IO_WORKERS, PG_IOV_MAX};

mod context;

pub mod method;
pub use method::IoMethod;

pub mod storage;

pub mod stream;
pub use stream::{ReadStream, ReadStreamFlags};

mod utils;

#[cfg(test)]
mod test_utils;

#[doc(hidden)]
pub mod __private {
    use crate::AioError;

    /// Whether building the subsystem failed because the environment
    /// cannot run the requested IO method.
    pub fn is_unsupported(err: &AioError) -> bool {
        matches!(err, AioError::RingSetup { .. })
    }

    /// Return value of a test skipped for lack of support.
    pub trait Skip {
        fn skipped() -> Self;
    }

    impl Skip for () {
        fn skipped() -> Self {}
    }

    impl<E> Skip for Result<(), E> {
        fn skipped() -> Self {
            Ok(())
        }
    }
}
