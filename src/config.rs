//! Process configuration. Every value comes from the environment; only `SFU_JWT_SECRET` is
//! required.

use std::{env, net::IpAddr, str::FromStr, time::Duration};

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{ConfigErrorKind, Error};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub transport: WebRTCTransportConfig,
    pub media: MediaConfig,
    pub session: SessionConfig,
    /// `None` disables the discovery heartbeat.
    pub discovery: Option<DiscoveryConfig>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
}

#[derive(Clone)]
pub struct AuthConfig {
    /// HS256 shared secret.
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    /// Expected value of the `typ` claim.
    pub token_type: String,
    pub leeway_secs: u64,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("token_type", &self.token_type)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Configuration for [`crate::transport::PeerTransport`].
#[derive(Debug, Clone, Default)]
pub struct WebRTCTransportConfig {
    pub ice_servers: Vec<RTCIceServer>,
    /// Public addresses written into host candidates (1:1 NAT).
    pub announced_ips: Vec<IpAddr>,
    pub port_range: Option<PortRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Cap applied to audio sections of every server-generated offer, bits per second.
    pub max_audio_bitrate: u64,
    pub keyframe_interval: Duration,
    /// How long an empty room is kept before it is dropped from the registry.
    pub room_grace_period: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_margin: Duration,
    pub outbound_queue: usize,
}

impl SessionConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval + self.heartbeat_margin
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub registry_url: String,
    pub token: Option<String>,
    pub id: String,
    pub region: String,
    /// Signaling endpoint advertised to clients.
    pub public_url: String,
    pub interval: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            max_audio_bitrate: 64_000,
            keyframe_interval: Duration::from_secs(3),
            room_grace_period: Duration::from_secs(10),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_margin: Duration::from_secs(10),
            outbound_queue: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let port: u16 = env.parse_or("PORT", 4000)?;
        let bind_address = env
            .get("BIND_ADDRESS")
            .unwrap_or_else(|| format!("0.0.0.0:{}", port));

        let public_ip = match env.get("PUBLIC_IP") {
            Some(ip) => Some(parse_value::<IpAddr>("PUBLIC_IP", &ip)?),
            None => None,
        };

        let port_range = match (env.get("RTC_MIN_PORT"), env.get("RTC_MAX_PORT")) {
            (Some(min), Some(max)) => {
                let range = PortRange {
                    min: parse_value("RTC_MIN_PORT", &min)?,
                    max: parse_value("RTC_MAX_PORT", &max)?,
                };
                if range.min > range.max {
                    return Err(Error::new_config(
                        format!("RTC_MIN_PORT {} is above RTC_MAX_PORT {}", range.min, range.max),
                        ConfigErrorKind::Invalid,
                    ));
                }
                Some(range)
            }
            (None, None) => None,
            _ => {
                return Err(Error::new_config(
                    "RTC_MIN_PORT and RTC_MAX_PORT must be set together".to_string(),
                    ConfigErrorKind::Missing,
                ))
            }
        };

        let stun_urls = env
            .get("STUN_URLS")
            .unwrap_or_else(|| "stun:stun.l.google.com:19302".to_string());
        let urls: Vec<String> = stun_urls
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        let ice_servers = if urls.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls,
                ..Default::default()
            }]
        };

        let auth = AuthConfig {
            secret: env.required("SFU_JWT_SECRET")?,
            issuer: env.get("SFU_JWT_ISSUER").unwrap_or_else(|| "chat-api".to_string()),
            audience: env
                .get("SFU_JWT_AUDIENCE")
                .unwrap_or_else(|| "voice-sfu".to_string()),
            token_type: env
                .get("SFU_TOKEN_TYPE")
                .unwrap_or_else(|| "sfu_join".to_string()),
            leeway_secs: env.parse_or("SFU_TOKEN_LEEWAY_SECS", 5)?,
        };

        let media = MediaConfig {
            max_audio_bitrate: env.parse_or("SFU_MAX_AUDIO_BITRATE", 64_000)?,
            keyframe_interval: env.secs_or("SFU_KEYFRAME_INTERVAL_SECS", 3)?,
            room_grace_period: env.secs_or("SFU_ROOM_GRACE_SECS", 10)?,
        };

        let session = SessionConfig {
            join_timeout: env.secs_or("SFU_JOIN_TIMEOUT_SECS", 5)?,
            heartbeat_interval: env.secs_or("SFU_HEARTBEAT_INTERVAL_SECS", 15)?,
            heartbeat_margin: env.secs_or("SFU_HEARTBEAT_MARGIN_SECS", 10)?,
            outbound_queue: env.parse_or("SFU_OUTBOUND_QUEUE", 256)?,
        };

        let discovery = match env.get("DISCOVERY_URL") {
            Some(registry_url) => {
                let host = public_ip
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "localhost".to_string());
                Some(DiscoveryConfig {
                    registry_url,
                    token: env.get("DISCOVERY_TOKEN"),
                    id: env
                        .get("SFU_ID")
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    region: env.get("SFU_REGION").unwrap_or_else(|| "default".to_string()),
                    public_url: env
                        .get("SFU_PUBLIC_URL")
                        .unwrap_or_else(|| format!("ws://{}:{}/socket", host, port)),
                    interval: env.secs_or("DISCOVERY_INTERVAL_SECS", 10)?,
                })
            }
            None => None,
        };

        Ok(Self {
            server: ServerConfig { bind_address },
            auth,
            transport: WebRTCTransportConfig {
                ice_servers,
                announced_ips: public_ip.into_iter().collect(),
                port_range,
            },
            media,
            session,
            discovery,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String, Error> {
        self.get(key).ok_or_else(|| {
            Error::new_config(format!("{} is required", key), ConfigErrorKind::Missing)
        })
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, Error> {
        match self.get(key) {
            Some(value) => parse_value(key, &value),
            None => Ok(default),
        }
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration, Error> {
        self.parse_or(key, default).map(Duration::from_secs)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value.trim().parse::<T>().map_err(|_| {
        Error::new_config(
            format!("failed to parse {}={}", key, value),
            ConfigErrorKind::Invalid,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::error::ErrorKind;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("SFU_JWT_SECRET", "s3cret")])).unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:4000");
        assert_eq!(config.auth.audience, "voice-sfu");
        assert_eq!(config.auth.token_type, "sfu_join");
        assert_eq!(config.media.max_audio_bitrate, 64_000);
        assert_eq!(config.session.heartbeat_timeout(), Duration::from_secs(25));
        assert_eq!(config.transport.ice_servers.len(), 1);
        assert!(config.transport.port_range.is_none());
        assert!(config.discovery.is_none());
    }

    #[test]
    fn test_secret_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ConfigError(ConfigErrorKind::Missing)
        ));
    }

    #[test]
    fn test_port_range_and_discovery() {
        let config = Config::from_lookup(lookup(&[
            ("SFU_JWT_SECRET", "s3cret"),
            ("PORT", "7000"),
            ("PUBLIC_IP", "203.0.113.9"),
            ("RTC_MIN_PORT", "40000"),
            ("RTC_MAX_PORT", "40100"),
            ("DISCOVERY_URL", "http://registry.internal/sfu"),
            ("SFU_REGION", "eu-west"),
        ]))
        .unwrap();
        assert_eq!(
            config.transport.port_range,
            Some(PortRange {
                min: 40000,
                max: 40100
            })
        );
        assert_eq!(config.transport.announced_ips.len(), 1);
        let discovery = config.discovery.unwrap();
        assert_eq!(discovery.region, "eu-west");
        assert_eq!(discovery.public_url, "ws://203.0.113.9:7000/socket");
    }

    #[test]
    fn test_invalid_number() {
        let err = Config::from_lookup(lookup(&[
            ("SFU_JWT_SECRET", "s3cret"),
            ("SFU_MAX_AUDIO_BITRATE", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ConfigError(ConfigErrorKind::Invalid)
        ));
    }

    #[test]
    fn test_half_port_range_is_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("SFU_JWT_SECRET", "s3cret"),
            ("RTC_MIN_PORT", "40000"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ConfigError(ConfigErrorKind::Missing)
        ));
    }
}
