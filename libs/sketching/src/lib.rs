#![warn(unused_extern_crates)]
use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::field::{Field, Visit};
use tracing_forest::printer::TestCapturePrinter;
use tracing_forest::util::*;
use tracing_forest::Tag;
use tracing_subscriber::prelude::*;

pub mod macros;

pub use {tracing, tracing_forest, tracing_subscriber};

/// Start up the logging for test mode.
pub fn test_init() {
    let filter = EnvFilter::from_default_env().add_directive(LevelFilter::TRACE.into());

    let _ = tracing_subscriber::Registry::default()
        .with(ForestLayer::new(TestCapturePrinter::new(), event_tagger).with_filter(filter))
        .try_init();
}

#[derive(Default)]
struct EventTagVisitor {
    id: Option<u64>,
}

impl Visit for EventTagVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "event_tag_id" {
            self.id = Some(value);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn fmt::Debug) {}
}

/// Tag events raised through the tagged macros, eg `admin.info`. Untagged
/// events are printed as-is.
pub fn event_tagger(event: &Event) -> Option<Tag> {
    let mut visitor = EventTagVisitor::default();
    event.record(&mut visitor);
    let tag = EventTag::try_from(visitor.id?).ok()?;
    let (prefix, suffix) = tag.pretty().split_once('.')?;
    Some(
        Tag::builder()
            .prefix(prefix)
            .suffix(suffix)
            .icon(tag.icon())
            .build(),
    )
}

#[derive(Debug, Clone, Copy, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum EventTag {
    AdminDebug,
    AdminError,
    AdminWarn,
    AdminInfo,
    RequestError,
    RequestWarn,
    RequestInfo,
    RequestTrace,
    SecurityInfo,
    SecurityError,
    /// A captured interaction, as handed to storage.
    InteractionDebug,
    InteractionWarn,
}

impl EventTag {
    pub fn pretty(self) -> &'static str {
        match self {
            EventTag::AdminDebug => "admin.debug",
            EventTag::AdminError => "admin.error",
            EventTag::AdminWarn => "admin.warn",
            EventTag::AdminInfo => "admin.info",
            EventTag::RequestError => "request.error",
            EventTag::RequestWarn => "request.warn",
            EventTag::RequestInfo => "request.info",
            EventTag::RequestTrace => "request.trace",
            EventTag::SecurityInfo => "security.info",
            EventTag::SecurityError => "security.error",
            EventTag::InteractionDebug => "interaction.debug",
            EventTag::InteractionWarn => "interaction.warn",
        }
    }

    pub fn icon(self) -> char {
        use EventTag::*;
        match self {
            AdminDebug => '🐛',
            AdminError | RequestError => '🚨',
            AdminWarn | RequestWarn | InteractionWarn => '⚠',
            AdminInfo | RequestInfo => 'ℹ',
            RequestTrace => '📍',
            SecurityInfo => '🔓',
            SecurityError => '🔐',
            InteractionDebug => '🎣',
        }
    }
}
