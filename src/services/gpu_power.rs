//! GPU host power management with Wake-on-LAN support.
//!
//! The LLM runs on a dedicated host that sleeps most of the day. This manager
//! detects when the host is down, wakes it with a magic packet, polls the LLM
//! endpoint until it answers, and shuts the host down again over SSH once it
//! has been idle long enough - but only if we were the ones who woke it and
//! nobody is logged in interactively.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::GpuPowerConfig;

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),

    #[error("Remote command failed: {0}")]
    Remote(String),
}

/// Outcome of the LLM worker's entry gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Host is up; go ahead.
    Ready,
    /// Host is down and the active-hours policy forbids waking it now.
    DeniedOutsideHours,
    /// Wake was attempted but the host did not come up in time.
    WakeFailed,
}

/// Clock seam so the active-hours policy is testable.
pub trait Clock: Send + Sync {
    fn now_local(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_local(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Cheap availability probe against the LLM endpoint.
#[async_trait]
pub trait HostProbe: Send + Sync {
    async fn is_available(&self) -> bool;
}

/// HTTP probe against Ollama's tags endpoint.
pub struct HttpProbe {
    http: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(ollama_base_url: &str, timeout_secs: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { http, url: format!("{}/api/tags", ollama_base_url.trim_end_matches('/')) }
    }
}

#[async_trait]
impl HostProbe for HttpProbe {
    async fn is_available(&self) -> bool {
        match self.http.get(&self.url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("LLM endpoint not available at {}: {}", self.url, e);
                false
            },
        }
    }
}

/// Remote shell seam: enumerate interactive logins and issue the shutdown.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Usernames of interactive sessions (`who` output, first column).
    async fn interactive_logins(&self) -> Result<Vec<String>, PowerError>;

    async fn shutdown(&self) -> Result<(), PowerError>;
}

/// SSH implementation with key-only auth.
pub struct SshShell {
    host: String,
    user: String,
    key_path: String,
}

impl SshShell {
    pub fn new(host: &str, user: &str, key_path: &str) -> Self {
        Self { host: host.to_string(), user: user.to_string(), key_path: key_path.to_string() }
    }

    fn command(&self, remote_args: &[&str]) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(format!("{}@{}", self.user, self.host))
            .args(remote_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn interactive_logins(&self) -> Result<Vec<String>, PowerError> {
        let child = self.command(&["who"]).spawn()?;
        let output = tokio::time::timeout(Duration::from_secs(15), child.wait_with_output())
            .await
            .map_err(|_| PowerError::Remote("timeout running 'who'".to_string()))??;

        if !output.status.success() {
            return Err(PowerError::Remote(format!(
                "'who' failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let users = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split_whitespace().next().map(str::to_string))
            .collect();
        Ok(users)
    }

    async fn shutdown(&self) -> Result<(), PowerError> {
        tracing::info!("Shutting down GPU host via SSH ({}@{})", self.user, self.host);

        let child = self.command(&["sudo", "shutdown", "-h", "now"]).spawn()?;
        let output =
            match tokio::time::timeout(Duration::from_secs(15), child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    // Shutdown often drops the connection before returning.
                    tracing::warn!("Shutdown command timed out (may have worked)");
                    return Ok(());
                },
            };

        match output.status.code() {
            Some(0) => {
                tracing::info!("GPU host shutdown command sent successfully");
                Ok(())
            },
            // 255 is expected when the connection drops during shutdown.
            Some(255) => {
                tracing::info!("GPU host shutdown initiated (connection closed)");
                Ok(())
            },
            code => Err(PowerError::Remote(format!(
                "shutdown command returned {:?}: {}",
                code,
                String::from_utf8_lossy(&output.stderr)
            ))),
        }
    }
}

/// Wake transport seam.
#[async_trait]
pub trait WakeTransport: Send + Sync {
    async fn send_magic_packet(&self) -> Result<(), PowerError>;
}

/// Magic packet over UDP port 9 to the configured broadcast address.
pub struct UdpWakeTransport {
    mac: [u8; 6],
    broadcast: String,
}

impl UdpWakeTransport {
    pub fn new(mac_address: &str, broadcast: &str) -> Result<Self, PowerError> {
        Ok(Self { mac: parse_mac(mac_address)?, broadcast: broadcast.to_string() })
    }
}

#[async_trait]
impl WakeTransport for UdpWakeTransport {
    async fn send_magic_packet(&self) -> Result<(), PowerError> {
        let packet = build_magic_packet(&self.mac);
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.set_broadcast(true)?;
        socket.send_to(&packet, (self.broadcast.as_str(), 9)).await?;
        Ok(())
    }
}

/// Parse a MAC address in `xx:xx:xx:xx:xx:xx` (or `-`-separated) form.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], PowerError> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(PowerError::InvalidMac(mac.to_string()));
    }
    let mut bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        bytes[i] =
            u8::from_str_radix(part, 16).map_err(|_| PowerError::InvalidMac(mac.to_string()))?;
    }
    Ok(bytes)
}

/// 6 bytes of 0xFF followed by the MAC repeated 16 times.
pub fn build_magic_packet(mac: &[u8; 6]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(102);
    packet.extend_from_slice(&[0xFF; 6]);
    for _ in 0..16 {
        packet.extend_from_slice(mac);
    }
    packet
}

#[derive(Debug, Default)]
struct PowerState {
    /// True iff we sent the wake packet (the host "was sleeping").
    was_sleeping: bool,
    wake_time: Option<NaiveDateTime>,
    last_activity: Option<Instant>,
}

/// Power manager for the single GPU inference host.
///
/// The LLM worker is the only caller of `ensure_available`,
/// `record_activity` and `shutdown_if_idle`.
pub struct GpuPowerManager {
    config: GpuPowerConfig,
    probe: Arc<dyn HostProbe>,
    shell: Arc<dyn RemoteShell>,
    wake: Arc<dyn WakeTransport>,
    clock: Arc<dyn Clock>,
    state: Mutex<PowerState>,
}

impl GpuPowerManager {
    pub fn new(
        config: GpuPowerConfig,
        probe: Arc<dyn HostProbe>,
        shell: Arc<dyn RemoteShell>,
        wake: Arc<dyn WakeTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { config, probe, shell, wake, clock, state: Mutex::new(PowerState::default()) }
    }

    /// Production wiring from config. Returns None when WoL is disabled.
    pub fn from_config(
        config: &GpuPowerConfig,
        ollama_base_url: &str,
    ) -> Result<Option<Arc<Self>>, PowerError> {
        if !config.wol_enabled {
            tracing::debug!("GPU WoL disabled");
            return Ok(None);
        }

        let manager = Self::new(
            config.clone(),
            Arc::new(HttpProbe::new(ollama_base_url, config.health_timeout_secs)),
            Arc::new(SshShell::new(&config.ssh_host, &config.ssh_user, &config.ssh_key_path)),
            Arc::new(UdpWakeTransport::new(&config.mac_address, &config.broadcast)?),
            Arc::new(SystemClock),
        );

        let weekdays = if config.active_weekdays_only { " (Mon-Fri only)" } else { "" };
        tracing::info!(
            "GPU power manager initialized: MAC={}, active_hours={}:00-{}:00{}, broadcast={}, auto_shutdown={}",
            config.mac_address,
            config.active_hours_start,
            config.active_hours_end,
            weekdays,
            config.broadcast,
            config.auto_shutdown
        );

        Ok(Some(Arc::new(manager)))
    }

    /// Check whether the current local time permits waking the host.
    ///
    /// Same-day window [start, end); overnight window (start > end) wraps
    /// around midnight. Weekends are excluded when weekdays-only is set.
    pub fn is_within_active_hours(&self) -> bool {
        let now = self.clock.now_local();
        let hour = now.hour();

        if self.config.active_weekdays_only
            && now.weekday().num_days_from_monday() >= 5
        {
            return false;
        }

        let start = self.config.active_hours_start;
        let end = self.config.active_hours_end;

        if start < end {
            start <= hour && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub async fn is_available(&self) -> bool {
        self.probe.is_available().await
    }

    async fn send_wake(&self) -> bool {
        match self.wake.send_magic_packet().await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                state.was_sleeping = true;
                state.wake_time = Some(self.clock.now_local());
                tracing::info!(
                    "Sent WoL packet to {} via {}:9",
                    self.config.mac_address,
                    self.config.broadcast
                );
                true
            },
            Err(e) => {
                tracing::error!("Failed to send WoL packet: {}", e);
                false
            },
        }
    }

    /// Poll the probe until the host answers or the wake timeout expires.
    async fn wait_for_ready(&self) -> bool {
        let timeout = Duration::from_secs(self.config.wake_timeout_secs);
        let poll_interval = Duration::from_secs(5);
        let start = Instant::now();

        tracing::info!("Waiting up to {:?} for the LLM endpoint to become available...", timeout);

        while start.elapsed() < timeout {
            if self.probe.is_available().await {
                tracing::info!("LLM endpoint available after {:?}", start.elapsed());
                return true;
            }
            sleep(poll_interval).await;
        }

        tracing::warn!("Timeout after {:?} waiting for the LLM endpoint", timeout);
        false
    }

    /// The LLM worker's entry gate.
    ///
    /// Active hours only restrict WAKING the host: an already-running host is
    /// used regardless of the time.
    pub async fn ensure_available(&self) -> EnsureOutcome {
        if self.is_available().await {
            tracing::debug!("GPU host already available");
            self.record_activity().await;
            return EnsureOutcome::Ready;
        }

        // Host is down. If we previously woke it, it was shut down
        // externally; forget that wake.
        {
            let mut state = self.state.lock().await;
            if state.was_sleeping {
                tracing::info!("GPU host went down (external shutdown), resetting wake state");
                *state = PowerState::default();
            }
        }

        if !self.is_within_active_hours() {
            let now = self.clock.now_local();
            tracing::info!(
                "GPU host not available and outside active hours (current: {}:00, allowed: {}:00-{}:00). Skipping WoL, items will be queued.",
                now.hour(),
                self.config.active_hours_start,
                self.config.active_hours_end
            );
            return EnsureOutcome::DeniedOutsideHours;
        }

        tracing::info!("GPU host not available, sending Wake-on-LAN...");
        if !self.send_wake().await {
            return EnsureOutcome::WakeFailed;
        }

        if self.wait_for_ready().await {
            tracing::info!("GPU host woken and ready for LLM processing");
            self.record_activity().await;
            EnsureOutcome::Ready
        } else {
            tracing::error!("GPU host did not respond after WoL");
            EnsureOutcome::WakeFailed
        }
    }

    /// Record that LLM processing made progress.
    pub async fn record_activity(&self) {
        self.state.lock().await.last_activity = Some(Instant::now());
    }

    /// Seconds since the last recorded activity (infinite if never active).
    pub async fn idle_time(&self) -> Duration {
        match self.state.lock().await.last_activity {
            Some(at) => at.elapsed(),
            None => Duration::MAX,
        }
    }

    /// True if users besides the service user (and the display manager) are
    /// logged in. Fails safe: any error counts as "users present".
    pub async fn has_other_users(&self) -> bool {
        match self.shell.interactive_logins().await {
            Ok(users) => {
                let others: Vec<String> = users
                    .into_iter()
                    .filter(|u| u != &self.config.ssh_user && u != "sddm")
                    .collect();
                if !others.is_empty() {
                    tracing::info!(
                        "Users logged into GPU host: {} - skipping shutdown",
                        others.join(", ")
                    );
                    return true;
                }
                false
            },
            Err(e) => {
                tracing::warn!("Error checking GPU host users, assuming users present: {}", e);
                true
            },
        }
    }

    /// Shut the host down if we woke it, it has been idle past the threshold,
    /// and nobody else is logged in. Returns true if a shutdown was issued.
    pub async fn shutdown_if_idle(&self) -> bool {
        if !self.config.auto_shutdown {
            return false;
        }

        if !self.state.lock().await.was_sleeping {
            return false;
        }

        let idle = self.idle_time().await;
        let threshold = Duration::from_secs(self.config.idle_timeout_secs);
        if idle < threshold {
            tracing::debug!("GPU host idle for {:?}, threshold is {:?}", idle, threshold);
            return false;
        }

        if self.has_other_users().await {
            tracing::debug!("Skipping shutdown due to other users on the GPU host");
            return false;
        }

        tracing::info!(
            "GPU host idle for {:?} (>{:?}), no other users logged in, shutting down...",
            idle,
            threshold
        );

        match self.shell.shutdown().await {
            Ok(()) => {
                *self.state.lock().await = PowerState::default();
                true
            },
            Err(e) => {
                tracing::error!("Failed to shut down GPU host: {}", e);
                false
            },
        }
    }

    /// Current status for the admin surface.
    pub async fn status(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        serde_json::json!({
            "was_sleeping": state.was_sleeping,
            "wake_time": state.wake_time.map(|t| t.to_string()),
            "idle_secs": state.last_activity.map(|at| at.elapsed().as_secs()),
            "auto_shutdown": self.config.auto_shutdown,
            "idle_timeout_secs": self.config.idle_timeout_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FixedClock(NaiveDateTime);

    impl Clock for FixedClock {
        fn now_local(&self) -> NaiveDateTime {
            self.0
        }
    }

    struct FixedProbe(AtomicBool);

    #[async_trait]
    impl HostProbe for FixedProbe {
        async fn is_available(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct FakeShell {
        logins: Vec<String>,
        shutdowns: AtomicU32,
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn interactive_logins(&self) -> Result<Vec<String>, PowerError> {
            Ok(self.logins.clone())
        }

        async fn shutdown(&self) -> Result<(), PowerError> {
            self.shutdowns.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    struct NoopWake;

    #[async_trait]
    impl WakeTransport for NoopWake {
        async fn send_magic_packet(&self) -> Result<(), PowerError> {
            Ok(())
        }
    }

    fn manager_at(
        datetime: NaiveDateTime,
        available: bool,
        logins: Vec<String>,
    ) -> (GpuPowerManager, Arc<FakeShell>) {
        let shell = Arc::new(FakeShell { logins, shutdowns: AtomicU32::new(0) });
        let mut config = GpuPowerConfig::default();
        config.wol_enabled = true;
        config.mac_address = "aa:bb:cc:dd:ee:ff".to_string();
        config.wake_timeout_secs = 0;
        let manager = GpuPowerManager::new(
            config,
            Arc::new(FixedProbe(AtomicBool::new(available))),
            shell.clone(),
            Arc::new(NoopWake),
            Arc::new(FixedClock(datetime)),
        );
        (manager, shell)
    }

    fn at(y: i32, m: u32, d: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(hour, 0, 0).unwrap()
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        let packet = build_magic_packet(&mac);
        assert_eq!(packet.len(), 102);
        assert_eq!(&packet[..6], &[0xFF; 6]);
        assert_eq!(&packet[6..12], &mac);
        assert_eq!(&packet[96..102], &mac);
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("zz:bb:cc:dd:ee:ff").is_err());
        assert!(parse_mac("aa-bb-cc-dd-ee-ff").is_ok());
    }

    #[tokio::test]
    async fn test_active_hours_same_day_window() {
        // Wednesday 2025-01-15.
        let (manager, _) = manager_at(at(2025, 1, 15, 10), false, vec![]);
        assert!(manager.is_within_active_hours());

        let (manager, _) = manager_at(at(2025, 1, 15, 16), false, vec![]);
        assert!(!manager.is_within_active_hours());

        let (manager, _) = manager_at(at(2025, 1, 15, 6), false, vec![]);
        assert!(!manager.is_within_active_hours());
    }

    #[tokio::test]
    async fn test_active_hours_weekend_excluded() {
        // Saturday 2025-01-18, 10:00 - inside the hour window but weekend.
        let (manager, _) = manager_at(at(2025, 1, 18, 10), false, vec![]);
        assert!(!manager.is_within_active_hours());
        assert_eq!(manager.ensure_available().await, EnsureOutcome::DeniedOutsideHours);
    }

    fn overnight_manager(datetime: NaiveDateTime) -> GpuPowerManager {
        let mut config = GpuPowerConfig::default();
        config.active_hours_start = 22;
        config.active_hours_end = 6;
        config.active_weekdays_only = false;
        GpuPowerManager::new(
            config,
            Arc::new(FixedProbe(AtomicBool::new(false))),
            Arc::new(FakeShell { logins: vec![], shutdowns: AtomicU32::new(0) }),
            Arc::new(NoopWake),
            Arc::new(FixedClock(datetime)),
        )
    }

    #[tokio::test]
    async fn test_overnight_window_wraps() {
        assert!(overnight_manager(at(2025, 1, 15, 23)).is_within_active_hours());
        assert!(overnight_manager(at(2025, 1, 15, 3)).is_within_active_hours());
        assert!(!overnight_manager(at(2025, 1, 15, 12)).is_within_active_hours());
        assert!(!overnight_manager(at(2025, 1, 15, 6)).is_within_active_hours());
    }

    #[tokio::test]
    async fn test_already_available_host_used_outside_hours() {
        // Saturday, but the probe answers: no denial.
        let (manager, _) = manager_at(at(2025, 1, 18, 10), true, vec![]);
        assert_eq!(manager.ensure_available().await, EnsureOutcome::Ready);
    }

    #[tokio::test]
    async fn test_shutdown_requires_idle_and_own_wake() {
        let (manager, shell) = manager_at(at(2025, 1, 15, 10), false, vec![]);

        // Not woken by us: never shuts down.
        assert!(!manager.shutdown_if_idle().await);
        assert_eq!(shell.shutdowns.load(Ordering::Relaxed), 0);

        // Simulate our own wake with no recorded activity (idle = forever).
        manager.state.lock().await.was_sleeping = true;
        assert!(manager.shutdown_if_idle().await);
        assert_eq!(shell.shutdowns.load(Ordering::Relaxed), 1);

        // State resets after shutdown.
        assert!(!manager.state.lock().await.was_sleeping);
    }

    #[tokio::test]
    async fn test_shutdown_blocked_by_interactive_user() {
        let (manager, shell) =
            manager_at(at(2025, 1, 15, 10), false, vec!["alice".to_string()]);
        manager.state.lock().await.was_sleeping = true;

        assert!(!manager.shutdown_if_idle().await);
        assert_eq!(shell.shutdowns.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_service_and_display_manager_users_ignored() {
        let (manager, shell) = manager_at(
            at(2025, 1, 15, 10),
            false,
            vec!["newsroom".to_string(), "sddm".to_string()],
        );
        manager.state.lock().await.was_sleeping = true;

        assert!(manager.shutdown_if_idle().await);
        assert_eq!(shell.shutdowns.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_recent_activity_blocks_shutdown() {
        let (manager, shell) = manager_at(at(2025, 1, 15, 10), false, vec![]);
        manager.state.lock().await.was_sleeping = true;
        manager.record_activity().await;

        assert!(!manager.shutdown_if_idle().await);
        assert_eq!(shell.shutdowns.load(Ordering::Relaxed), 0);
    }
}
