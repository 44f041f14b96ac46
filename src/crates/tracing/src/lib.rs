#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]

pub use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;

pub struct TracingGuard {
    reload_handle: tracing_subscriber::reload::Handle<EnvFilter, tracing_subscriber::Registry>,
}

impl TracingGuard {
    pub fn change_log_level(&self, new_filter: EnvFilter) {
        let _ = self.reload_handle.modify(|filter| *filter = new_filter);
    }
}

pub fn init() -> anyhow::Result<TracingGuard> {
    tracing_log::LogTracer::init()?;
    let (log_env_filter, reload_handle) = tracing_subscriber::reload::Layer::new(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    let subscriber = tracing_subscriber::Registry::default()
        .with(log_env_filter)
        .with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(TracingGuard { reload_handle })
}
