use super::executor::AdbExecutor;
use super::{AdbError, AppInfo, Device, DeviceKind, DeviceState, Result, Tunnel};
use std::path::Path;
use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Server file on the device. Deliberately no `.jar` extension: the server
/// APK is pushed disguised as a plain file.
pub const SERVER_REMOTE_PATH: &str = "/data/local/tmp/scrcpy-server";

/// Entry point class inside the server blob
pub const SERVER_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";

/// Protocol version spoken with the server
pub const CLIENT_VERSION: &str = "3.3.4";

/// Port range scanned when creating tunnels
pub const DEFAULT_PORT_RANGE: (u16, u16) = (27183, 27299);

/// Emulator NAT and VPN subnets that must not be treated as a Wi-Fi address
const REJECTED_IP_PREFIXES: &[&str] = &["10.0.2.", "10.10.10."];

/// High-level ADB operations used by the session builder
pub struct AdbDriver {
    executor: AdbExecutor,
}

impl AdbDriver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            executor: AdbExecutor::new()?,
        })
    }

    pub fn with_executor(executor: AdbExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &AdbExecutor {
        &self.executor
    }

    /// List attached devices via `adb devices -l`
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let output = self.executor.run(&["devices", "-l"]).await?;
        Ok(parse_devices_output(&output.stdout))
    }

    /// Push the server blob to the device
    pub async fn push_server(&self, serial: &str, local: &Path) -> Result<()> {
        if !local.is_file() {
            return Err(AdbError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("server blob not found: {}", local.display()),
            )));
        }
        let local = local.to_string_lossy();
        self.executor
            .run(&["-s", serial, "push", &local, SERVER_REMOTE_PATH])
            .await?;
        info!("Server pushed to {}:{}", serial, SERVER_REMOTE_PATH);
        Ok(())
    }

    /// Wi-Fi address of the device. Prefers the `inet` line of
    /// `ip addr show wlan0`, falls back to `ip route` entries on wlan0.
    /// Emulator and VPN subnets are rejected.
    pub async fn get_device_ip(&self, serial: &str) -> Result<Option<String>> {
        match self
            .executor
            .run_with_timeout(
                &["-s", serial, "shell", "ip", "addr", "show", "wlan0"],
                Duration::from_secs(5),
            )
            .await
        {
            Ok(output) => {
                if let Some(ip) = parse_wlan0_inet(&output.stdout) {
                    info!("Device IP from wlan0: {}", ip);
                    return Ok(Some(ip));
                }
            }
            Err(e) => debug!("ip addr show wlan0 failed: {}", e),
        }

        let output = self
            .executor
            .run_with_timeout(
                &["-s", serial, "shell", "ip", "route"],
                Duration::from_secs(10),
            )
            .await?;
        if let Some(ip) = parse_ip_route_src(&output.stdout) {
            info!("Device IP from ip route (wlan0): {}", ip);
            return Ok(Some(ip));
        }

        warn!("Could not find a usable device IP on wlan0");
        Ok(None)
    }

    /// TCP port adbd currently listens on, if any
    pub async fn get_adb_tcp_port(&self, serial: &str) -> Result<Option<u16>> {
        let output = match self
            .executor
            .run_with_timeout(
                &["-s", serial, "shell", "getprop", "service.adb.tcp.port"],
                Duration::from_secs(5),
            )
            .await
        {
            Ok(output) => output,
            Err(_) => return Ok(None),
        };
        Ok(output.stdout.trim().parse::<u16>().ok())
    }

    /// Restart adbd in TCP/IP mode and poll until the port is reported.
    /// The USB connection survives the restart.
    pub async fn enable_tcpip(&self, serial: &str, port: u16) -> Result<bool> {
        info!("Enabling TCP/IP mode on port {}...", port);
        self.executor
            .run(&["-s", serial, "tcpip", &port.to_string()])
            .await?;

        self.wait_for_tcpip_enabled(serial, port).await
    }

    /// adbd takes a moment to restart after `adb tcpip`; poll the property
    /// until the expected port appears (40 attempts at 250 ms).
    pub async fn wait_for_tcpip_enabled(&self, serial: &str, expected_port: u16) -> Result<bool> {
        const MAX_ATTEMPTS: u32 = 40;
        const DELAY: Duration = Duration::from_millis(250);

        for attempt in 0..MAX_ATTEMPTS {
            if self.get_adb_tcp_port(serial).await? == Some(expected_port) {
                info!("TCP/IP mode enabled on port {}", expected_port);
                return Ok(true);
            }
            if attempt < MAX_ATTEMPTS - 1 {
                tokio::time::sleep(DELAY).await;
            }
        }

        warn!("Timeout waiting for TCP/IP mode on port {}", expected_port);
        Ok(false)
    }

    /// `adb connect <ip>:<port>`
    pub async fn connect_tcpip(&self, ip: &str, port: u16) -> Result<bool> {
        let endpoint = format!("{}:{}", ip, port);
        info!("Connecting to {}...", endpoint);
        let output = self.executor.run(&["connect", &endpoint]).await?;
        Ok(output.stdout.to_lowercase().contains("connected"))
    }

    /// `adb disconnect <ip>:<port>`. Failure is fine when the route is
    /// already gone.
    pub async fn disconnect_tcpip(&self, ip: &str, port: u16) -> Result<()> {
        let endpoint = format!("{}:{}", ip, port);
        if let Err(e) = self.executor.run(&["disconnect", &endpoint]).await {
            debug!("disconnect {} (may already be gone): {}", endpoint, e);
        }
        Ok(())
    }

    /// Create the ADB tunnel for the session's abstract socket. Tries
    /// `adb reverse` across the port range first; any failure falls back to
    /// `adb forward`. `force_forward` skips the reverse attempt entirely.
    pub async fn create_tunnel(
        &self,
        serial: &str,
        socket_name: &str,
        port_range: (u16, u16),
        force_forward: bool,
    ) -> Result<Tunnel> {
        if !force_forward {
            for port in port_range.0..=port_range.1 {
                match self.add_reverse(serial, socket_name, port).await {
                    Ok(()) => {
                        info!(
                            "Tunnel created (reverse): localabstract:{} <-> tcp:{}",
                            socket_name, port
                        );
                        return Ok(Tunnel {
                            enabled: true,
                            forward: false,
                            local_port: port,
                            socket_name: socket_name.to_string(),
                        });
                    }
                    Err(e) => {
                        warn!("adb reverse failed on port {}: {}; trying forward", port, e);
                        break;
                    }
                }
            }
        }

        for port in port_range.0..=port_range.1 {
            match self
                .executor
                .run_with_timeout(
                    &[
                        "-s",
                        serial,
                        "forward",
                        &format!("tcp:{}", port),
                        &format!("localabstract:{}", socket_name),
                    ],
                    Duration::from_secs(5),
                )
                .await
            {
                Ok(_) => {
                    info!(
                        "Tunnel created (forward): tcp:{} <-> localabstract:{}",
                        port, socket_name
                    );
                    return Ok(Tunnel {
                        enabled: true,
                        forward: true,
                        local_port: port,
                        socket_name: socket_name.to_string(),
                    });
                }
                Err(e) => debug!("adb forward failed on port {}: {}", port, e),
            }
        }

        Err(AdbError::Parse(format!(
            "no available tunnel port in range {}-{}",
            port_range.0, port_range.1
        )))
    }

    /// Add one reverse entry (used per-stream in reverse mode). Stale
    /// entries with the same name are removed first.
    pub async fn add_reverse(&self, serial: &str, socket_name: &str, port: u16) -> Result<()> {
        let _ = self
            .executor
            .run_with_timeout(
                &[
                    "-s",
                    serial,
                    "reverse",
                    "--remove",
                    &format!("localabstract:{}", socket_name),
                ],
                Duration::from_secs(2),
            )
            .await;

        self.executor
            .run_with_timeout(
                &[
                    "-s",
                    serial,
                    "reverse",
                    &format!("localabstract:{}", socket_name),
                    &format!("tcp:{}", port),
                ],
                Duration::from_secs(5),
            )
            .await?;
        Ok(())
    }

    pub async fn remove_reverse(&self, serial: &str, socket_name: &str) -> Result<()> {
        self.executor
            .run_with_timeout(
                &[
                    "-s",
                    serial,
                    "reverse",
                    "--remove",
                    &format!("localabstract:{}", socket_name),
                ],
                Duration::from_secs(5),
            )
            .await?;
        Ok(())
    }

    /// Tear down a tunnel created by `create_tunnel`
    pub async fn remove_tunnel(&self, serial: &str, tunnel: &Tunnel) -> Result<()> {
        if !tunnel.enabled {
            return Ok(());
        }
        if tunnel.forward {
            self.executor
                .run_with_timeout(
                    &[
                        "-s",
                        serial,
                        "forward",
                        "--remove",
                        &format!("tcp:{}", tunnel.local_port),
                    ],
                    Duration::from_secs(5),
                )
                .await?;
        } else {
            self.remove_reverse(serial, &tunnel.socket_name).await?;
        }
        info!(
            "Tunnel removed: {}",
            if tunnel.forward { "forward" } else { "reverse" }
        );
        Ok(())
    }

    /// Launch the server via `app_process`. In background mode the process
    /// is spawned and handed back to the caller, which kills it on
    /// teardown; otherwise the call blocks until the server exits.
    pub async fn start_server(
        &self,
        serial: &str,
        client_version: &str,
        server_params: &str,
        background: bool,
    ) -> Result<Option<Child>> {
        let classpath = format!("CLASSPATH={}", SERVER_REMOTE_PATH);
        let mut args: Vec<&str> = vec![
            "-s",
            serial,
            "shell",
            &classpath,
            "app_process",
            "/",
            SERVER_MAIN_CLASS,
            client_version,
        ];
        args.extend(server_params.split_whitespace());

        if background {
            let child = self.executor.spawn_background(&args)?;
            info!("Server started in background");
            Ok(Some(child))
        } else {
            self.executor.run(&args).await?;
            Ok(None)
        }
    }

    /// Out-of-band app listing: push the server and run it once with
    /// `list_apps=true`, parsing its log output.
    pub async fn list_apps(&self, serial: &str, server_blob: &Path) -> Result<Vec<AppInfo>> {
        info!("Listing applications on {} via adb...", serial);
        self.push_server(serial, server_blob).await?;

        let classpath = format!("CLASSPATH={}", SERVER_REMOTE_PATH);
        let output = self
            .executor
            .run_with_timeout(
                &[
                    "-s",
                    serial,
                    "shell",
                    &classpath,
                    "app_process",
                    "/",
                    SERVER_MAIN_CLASS,
                    CLIENT_VERSION,
                    "list_apps=true",
                ],
                Duration::from_secs(60),
            )
            .await?;

        Ok(parse_app_list_output(&output.stdout))
    }
}

/// Parse the output of `adb devices -l`
pub fn parse_devices_output(stdout: &str) -> Vec<Device> {
    let mut devices = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices") {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };

        let model = parts
            .filter_map(|p| p.strip_prefix("model:"))
            .next()
            .map(str::to_string);

        devices.push(Device {
            serial: serial.to_string(),
            state: DeviceState::from(state),
            kind: DeviceKind::from_serial(serial),
            model,
        });
    }
    devices
}

/// Extract the IPv4 address from an `ip addr show wlan0` inet line
pub fn parse_wlan0_inet(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with("inet ") {
            continue;
        }
        let addr = line.split_whitespace().nth(1)?;
        let ip = addr.split('/').next()?;
        if is_rejected_ip(ip) || !is_valid_ipv4(ip) {
            continue;
        }
        return Some(ip.to_string());
    }
    None
}

/// Extract the `src` address from `ip route` lines on wlan0
pub fn parse_ip_route_src(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        if !line.contains("wlan0") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        for (i, part) in parts.iter().enumerate() {
            if *part == "src" && i + 1 < parts.len() {
                let ip = parts[i + 1];
                if !is_rejected_ip(ip) && is_valid_ipv4(ip) {
                    return Some(ip.to_string());
                }
            }
        }
    }
    None
}

fn is_rejected_ip(ip: &str) -> bool {
    REJECTED_IP_PREFIXES.iter().any(|p| ip.starts_with(p))
}

fn is_valid_ipv4(ip: &str) -> bool {
    ip.parse::<std::net::Ipv4Addr>().is_ok()
}

/// Parse `list_apps=true` server output. Lines look like:
/// `[server] INFO:  * Camera                   com.android.camera`
/// with `*` marking system apps and `-` marking user apps.
pub fn parse_app_list_output(stdout: &str) -> Vec<AppInfo> {
    let mut apps = Vec::new();
    let mut in_list = false;

    for line in stdout.lines() {
        if line.contains("List of apps:") {
            in_list = true;
            continue;
        }
        if !in_list {
            continue;
        }

        let line = line
            .strip_prefix("[server]")
            .map(|rest| rest.trim_start_matches(" INFO:"))
            .unwrap_or(line);
        let trimmed = line.trim();
        if trimmed.len() < 4 {
            continue;
        }

        let (marker, rest) = trimmed.split_at(1);
        let system = match marker {
            "*" => true,
            "-" => false,
            _ => continue,
        };

        // Name and package are separated by a run of spaces; the package is
        // the last whitespace-free token.
        let rest = rest.trim();
        let Some(package) = rest.split_whitespace().next_back() else {
            continue;
        };
        let name = rest[..rest.len() - package.len()].trim();
        if name.is_empty() || !package.contains('.') {
            continue;
        }

        apps.push(AppInfo {
            name: name.to_string(),
            package: package.to_string(),
            system,
        });
    }

    apps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices_output() {
        let stdout = "List of devices attached\n\
                      R5CT102ABCD            device usb:1-4 product:a52 model:SM_A525F device:a52q transport_id:3\n\
                      192.168.1.23:5555      device product:a52 model:SM_A525F device:a52q transport_id:5\n\
                      emulator-5554          offline\n";
        let devices = parse_devices_output(stdout);
        assert_eq!(devices.len(), 3);

        assert_eq!(devices[0].serial, "R5CT102ABCD");
        assert_eq!(devices[0].kind, DeviceKind::Usb);
        assert_eq!(devices[0].model.as_deref(), Some("SM_A525F"));
        assert!(devices[0].is_ready());

        assert_eq!(devices[1].kind, DeviceKind::Tcpip);
        assert_eq!(devices[2].kind, DeviceKind::Emulator);
        assert_eq!(devices[2].state, DeviceState::Offline);
    }

    #[test]
    fn test_parse_wlan0_inet() {
        let stdout = "30: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n\
                      \tinet 192.168.1.42/24 brd 192.168.1.255 scope global wlan0\n\
                      \tinet6 fe80::1/64 scope link\n";
        assert_eq!(parse_wlan0_inet(stdout).as_deref(), Some("192.168.1.42"));
    }

    #[test]
    fn test_parse_wlan0_rejects_emulator_and_vpn() {
        let stdout = "\tinet 10.0.2.15/24 brd 10.0.2.255 scope global wlan0\n\
                      \tinet 10.10.10.4/24 scope global wlan0\n";
        assert_eq!(parse_wlan0_inet(stdout), None);
    }

    #[test]
    fn test_parse_ip_route_src() {
        let stdout =
            "192.168.1.0/24 dev wlan0 proto kernel scope link src 192.168.1.42\n\
             10.0.0.0/8 dev tun0 proto kernel scope link src 10.8.0.2\n";
        assert_eq!(parse_ip_route_src(stdout).as_deref(), Some("192.168.1.42"));
    }

    #[test]
    fn test_parse_app_list_output() {
        let stdout = "[server] INFO: List of apps:\n\
                      [server] INFO:  * Camera                     com.android.camera\n\
                      [server] INFO:  - Firefox                    org.mozilla.firefox\n";
        let apps = parse_app_list_output(stdout);
        assert_eq!(
            apps,
            vec![
                AppInfo {
                    name: "Camera".to_string(),
                    package: "com.android.camera".to_string(),
                    system: true,
                },
                AppInfo {
                    name: "Firefox".to_string(),
                    package: "org.mozilla.firefox".to_string(),
                    system: false,
                },
            ]
        );
    }

    #[test]
    fn test_parse_app_list_keeps_multiword_names() {
        let stdout = "[server] INFO: List of apps:\n\
                      [server] INFO:  - Google Play Store          com.android.vending\n";
        let apps = parse_app_list_output(stdout);
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "Google Play Store");
        assert_eq!(apps[0].package, "com.android.vending");
    }
}
