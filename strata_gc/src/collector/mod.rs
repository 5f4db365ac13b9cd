//! Collectors.
//!
//! Only the minor collector lives here; major collections are run by the
//! tenured collector and reported back through
//! [`GcHeap::record_major_collection`](crate::GcHeap::record_major_collection).

mod minor;
pub mod tenuring;

pub(crate) use minor::collect as collect_minor;
pub use minor::MinorGcReport;
pub use tenuring::TenuringTracer;
