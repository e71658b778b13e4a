//! Firmware image model.

pub mod page;
pub mod srec;

pub use page::{DEFAULT_PAGE_SIZE, Page, PageBuffer, Paginated, paginate};
pub use srec::{FlashRecord, Image, ParseWarning, RecordKind, WarningKind};
