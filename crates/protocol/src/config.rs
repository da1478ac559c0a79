use serde::{Deserialize, Serialize};

/// Top-level agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareConfig {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the signaling server (ws:// or wss://)
    #[serde(default = "default_signaling_url")]
    pub url: String,
    /// PEM certificate to pin for wss:// connections (system roots are always loaded)
    pub tls_cert: Option<String>,
    /// Largest inbound frame accepted, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Capture profile. Replaces per-device hard-coded resolution/bitrate variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Output width in pixels
    #[serde(default = "default_width")]
    pub width: u32,
    /// Output height in pixels
    #[serde(default = "default_height")]
    pub height: u32,
    /// Target framerate
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    /// Target bitrate in kbps
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    /// Force a specific encoder: "nvh264enc", "vah264enc", "x264enc"
    pub encoder: Option<String>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478?transport=udp")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

/// Overrides for the parts of the device identifier that are normally detected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    /// Management-assigned id appended to the device identifier
    pub enterprise_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// File holding "active <device id>" while a session is live
    pub status_file: Option<String>,
}

/// One ICE server entry as handed to the peer-connection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerInfo {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
            tls_cert: None,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            framerate: default_framerate(),
            bitrate: default_bitrate(),
            encoder: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl IceConfig {
    /// Flatten STUN and TURN settings into engine-ready server entries.
    /// TURN URLs share one credential pair.
    pub fn servers(&self) -> Vec<IceServerInfo> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(IceServerInfo {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }
        servers
    }
}

impl ShareConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the agent should not start) or
    /// "WARNING:" (advisory, the agent can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- Signaling ---
        let url = &self.signaling.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            issues.push(format!(
                "ERROR: signaling.url '{url}' must start with 'ws://' or 'wss://'"
            ));
        }
        if self.signaling.tls_cert.is_some() && url.starts_with("ws://") {
            issues.push(
                "WARNING: signaling.tls_cert is set but signaling.url is plain ws://, \
                 the certificate will not be used"
                    .to_string(),
            );
        }
        if let Some(cert) = &self.signaling.tls_cert
            && !std::path::Path::new(cert).exists()
        {
            issues.push(format!("ERROR: signaling.tls_cert '{cert}' does not exist"));
        }
        if self.signaling.max_message_size < 4096 {
            issues.push(format!(
                "ERROR: signaling.max_message_size must be at least 4096 bytes, got {}. \
                 SDP offers alone are typically 2-6 KB.",
                self.signaling.max_message_size
            ));
        }

        // --- Capture ---
        if self.capture.framerate == 0 || self.capture.framerate > 60 {
            issues.push(format!(
                "ERROR: capture.framerate must be between 1 and 60, got {}",
                self.capture.framerate
            ));
        }
        for (name, value) in [("width", self.capture.width), ("height", self.capture.height)] {
            if value < 16 {
                issues.push(format!(
                    "ERROR: capture.{name} must be at least 16 pixels, got {value}"
                ));
            } else if value % 2 != 0 {
                issues.push(format!(
                    "ERROR: capture.{name} must be even for H.264 4:2:0 encoding, got {value}"
                ));
            }
        }
        if self.capture.bitrate == 0 {
            issues.push("ERROR: capture.bitrate must be greater than 0".to_string());
        } else if self.capture.bitrate > 50_000 {
            issues.push(format!(
                "WARNING: capture.bitrate {} kbps is unusually high for screen sharing",
                self.capture.bitrate
            ));
        }
        if let Some(encoder) = &self.capture.encoder
            && !matches!(encoder.as_str(), "nvh264enc" | "vah264enc" | "x264enc")
        {
            issues.push(format!(
                "ERROR: capture.encoder '{encoder}' is not supported. \
                 Use nvh264enc, vah264enc, or x264enc."
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{url}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302"
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{url}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478"
                ));
            }
        }
        if !self.ice.turn_urls.is_empty()
            && (self.ice.turn_username.is_none() || self.ice.turn_credential.is_none())
        {
            issues.push(
                "WARNING: ice.turn_urls is set without turn_username/turn_credential. \
                 Most TURN servers reject unauthenticated allocations."
                    .to_string(),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_signaling_url() -> String {
    "wss://localhost:8443/ws".to_string()
}
fn default_max_message_size() -> usize {
    65_536
}
fn default_width() -> u32 {
    480
}
fn default_height() -> u32 {
    960
}
fn default_framerate() -> u32 {
    15
}
fn default_bitrate() -> u32 {
    1500
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
