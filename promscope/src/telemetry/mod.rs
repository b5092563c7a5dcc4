//! Service telemetry: logging and service metrics.

pub mod log;
pub mod metrics;
pub mod settings;

use crate::{BootstrapResult, ServiceInfo};
use self::settings::TelemetrySettings;

/// Initializes logging and the metrics registry from the settings.
///
/// Does nothing if telemetry has already been initialized in this process.
pub fn init(service_info: &ServiceInfo, settings: &TelemetrySettings) -> BootstrapResult<()> {
    log::init(service_info, &settings.logging)?;
    metrics::init();

    Ok(())
}
