pub mod backoff;
pub mod daemon;
pub mod scan;
pub mod sync;
