use std::time::Duration;
use anyhow::bail;
use crate::frame::Frame;

#[derive(Debug, Clone)]
pub struct NtpConfig {
    /// Period of the retransmission loop. Every tick resends all unacknowledged data frames and
    ///  pending control frames of every tracked connection.
    ///
    /// There is no round trip estimation: this should comfortably exceed the link's round trip
    ///  time, otherwise frames are retransmitted before their acks can possibly arrive.
    pub retransmit_interval: Duration,

    /// Maximum number of payload bytes per data frame. Outbound data is cut into chunks of this
    ///  size, so smaller values mean more frames (and more window slots) for the same data.
    pub max_payload_len: usize,

    /// Seed for the ephemeral port allocator, for reproducible port choices. `None` seeds from
    ///  system entropy.
    pub port_seed: Option<u64>,
}

impl Default for NtpConfig {
    fn default() -> Self {
        NtpConfig {
            retransmit_interval: Duration::from_millis(100),
            max_payload_len: Frame::MAX_PAYLOAD_LEN,
            port_seed: None,
        }
    }
}

impl NtpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_interval.is_zero() {
            bail!("retransmit interval must be positive");
        }
        if self.max_payload_len == 0 {
            bail!("max payload length must be positive");
        }
        if self.max_payload_len > Frame::MAX_PAYLOAD_LEN {
            bail!("max payload length {} exceeds the {} bytes that fit into a frame", self.max_payload_len, Frame::MAX_PAYLOAD_LEN);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(NtpConfig::default().validate().is_ok());
    }

    #[test]
    fn test_debug_shows_settings() {
        let config = NtpConfig { port_seed: Some(3), ..NtpConfig::default() };
        let logged = format!("{:?}", config.clone());
        assert!(logged.contains("retransmit_interval: 100ms"));
        assert!(logged.contains("port_seed: Some(3)"));
    }

    #[rstest]
    #[case::zero_interval(Duration::ZERO, 10, false)]
    #[case::zero_payload(Duration::from_millis(1), 0, false)]
    #[case::one_byte_payload(Duration::from_millis(1), 1, true)]
    #[case::max_payload(Duration::from_secs(1), Frame::MAX_PAYLOAD_LEN, true)]
    #[case::payload_too_big(Duration::from_secs(1), Frame::MAX_PAYLOAD_LEN + 1, false)]
    fn test_validate(#[case] retransmit_interval: Duration, #[case] max_payload_len: usize, #[case] expected_ok: bool) {
        let config = NtpConfig {
            retransmit_interval,
            max_payload_len,
            port_seed: Some(1),
        };
        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}
