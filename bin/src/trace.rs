//! tracing configuration
use anyhow::Result;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{
        self,
        format::{Format, PrettyFields},
    },
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

use crate::cli::LogFormat;

/// Install the global subscriber. `directives` accepts anything `RUST_LOG` does.
pub fn init(directives: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(directives)
        .or_else(|_| EnvFilter::try_new("info"))?
        .add_directive("hyper=off".parse()?);

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .event_format(Format::default().pretty().with_source_location(false))
                        .fmt_fields(PrettyFields::new()),
                )
                .init();
        }
        LogFormat::Standard => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
    Ok(())
}
