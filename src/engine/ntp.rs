//! Periodic SNTP time query.

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};

use crate::config::NtpOptions;
use crate::engine::BuildError;
use crate::lifecycle::Context;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// A validated NTP service, started by the engine.
///
/// Queries go out from a local UDP socket. `detour` is checked against the
/// outbound table but not dialed through, since no outbound here carries UDP.
#[derive(Debug, Clone)]
pub struct NtpService {
    server: String,
    port: u16,
    interval: Duration,
}

impl NtpService {
    /// `Ok(None)` when the service is disabled.
    pub fn build(options: &NtpOptions, outbounds: &HashSet<String>) -> Result<Option<Self>, BuildError> {
        if !options.enabled {
            return Ok(None);
        }
        if options.server.is_empty() {
            return Err(BuildError::Missing("server"));
        }
        let interval = options
            .interval
            .parse_or(DEFAULT_INTERVAL)
            .map_err(|_| BuildError::invalid("interval", options.interval.to_string()))?;
        if interval.is_zero() {
            return Err(BuildError::invalid("interval", options.interval.to_string()));
        }
        if !options.detour.is_empty() && !outbounds.contains(&options.detour) {
            return Err(BuildError::OutboundNotFound(options.detour.clone()));
        }
        let port = if options.server_port == 0 { 123 } else { options.server_port };

        Ok(Some(Self {
            server: options.server.clone(),
            port,
            interval,
        }))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn server(&self) -> (&str, u16) {
        (&self.server, self.port)
    }

    /// Query the server every interval until cancelled or shut down.
    pub async fn run(self, ctx: Context, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        tracing::debug!(
            server = %self.server,
            port = self.port,
            interval = ?self.interval,
            "NTP service started"
        );
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => match self.query().await {
                    Ok(unix_secs) => tracing::debug!(server = %self.server, unix_secs, "NTP time updated"),
                    Err(e) => tracing::warn!(server = %self.server, error = %e, "NTP query failed"),
                },
            }
        }
        tracing::debug!("NTP service stopped");
    }

    /// One SNTP round trip; returns the server's transmit time in Unix seconds.
    async fn query(&self) -> std::io::Result<u64> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((self.server.as_str(), self.port)).await?;

        let mut request = [0u8; 48];
        // LI = 0, version 3, mode 3 (client).
        request[0] = 0x1B;
        socket.send(&request).await?;

        let mut response = [0u8; 48];
        let received = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut response))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "ntp query timed out"))??;
        parse_transmit_time(&response[..received])
    }
}

fn parse_transmit_time(packet: &[u8]) -> std::io::Result<u64> {
    if packet.len() < 48 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("short ntp response: {} bytes", packet.len()),
        ));
    }
    let mut seconds = [0u8; 4];
    seconds.copy_from_slice(&packet[40..44]);
    let ntp_secs = u64::from(u32::from_be_bytes(seconds));
    ntp_secs.checked_sub(NTP_UNIX_OFFSET).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "ntp timestamp before unix epoch")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurationStr;
    use crate::routing::tag_set;

    fn enabled(server: &str) -> NtpOptions {
        NtpOptions {
            enabled: true,
            server: server.into(),
            ..Default::default()
        }
    }

    #[test]
    fn disabled_service_is_not_built() {
        let service = NtpService::build(&NtpOptions::default(), &HashSet::new()).unwrap();
        assert!(service.is_none());
    }

    #[test]
    fn enabled_service_needs_server() {
        let err = NtpService::build(&enabled(""), &HashSet::new()).unwrap_err();
        assert!(matches!(err, BuildError::Missing("server")));
    }

    #[test]
    fn interval_defaults_and_parses() {
        let service = NtpService::build(&enabled("time.apple.com"), &HashSet::new())
            .unwrap()
            .unwrap();
        assert_eq!(service.interval(), DEFAULT_INTERVAL);
        assert_eq!(service.server(), ("time.apple.com", 123));

        let mut options = enabled("time.apple.com");
        options.interval = DurationStr("soon".into());
        assert!(matches!(
            NtpService::build(&options, &HashSet::new()).unwrap_err(),
            BuildError::Invalid { field: "interval", .. }
        ));
    }

    #[test]
    fn detour_must_exist() {
        let mut options = enabled("time.apple.com");
        options.detour = "proxy".into();
        let err = NtpService::build(&options, &tag_set(["direct"])).unwrap_err();
        assert_eq!(err.to_string(), "outbound not found: proxy");

        options.detour = "direct".into();
        let service = NtpService::build(&options, &tag_set(["direct"])).unwrap().unwrap();
        assert_eq!(service.server(), ("time.apple.com", 123));
    }

    #[test]
    fn parses_transmit_timestamp() {
        let mut packet = [0u8; 48];
        // 2024-01-01T00:00:00Z
        let ntp_secs = (1_704_067_200u64 + NTP_UNIX_OFFSET) as u32;
        packet[40..44].copy_from_slice(&ntp_secs.to_be_bytes());
        assert_eq!(parse_transmit_time(&packet).unwrap(), 1_704_067_200);
        assert!(parse_transmit_time(&packet[..20]).is_err());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let service = NtpService::build(&enabled("127.0.0.1"), &HashSet::new())
            .unwrap()
            .unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(service.run(Context::new(), rx));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
