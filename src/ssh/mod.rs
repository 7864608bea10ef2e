pub mod client;
pub mod dialer;
pub mod hostkeys;
pub mod probe;

pub use client::GatewayHandler;
pub use dialer::{dial, ClientHandle, Credential, DialError, DialerConfig, Target};
pub use probe::{sample as sample_telemetry, HostInfo, RemoteMetricSample};
