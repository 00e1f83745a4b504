//! The network publication file: a small text file telling clients where
//! the server is listening.
//!
//! ```text
//! # File holding network information for external communications
//! ip_address=192.168.1.10
//! port=12345
//! ```

use std::fmt::Write as _;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Read `ip_address=` and `port=` entries. Lines starting with `#` and
/// trailing `#` comments are ignored.
pub fn read_network_file(path: &Path) -> Result<SocketAddr, String> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Unable to read {}: {e}", path.display()))?;
    parse_network_info(&text).map_err(|e| format!("{}: {e}", path.display()))
}

/// Publish a listening address for clients to find.
pub fn write_network_file(path: &Path, addr: SocketAddr) -> Result<(), String> {
    fs::write(path, render_network_info(addr))
        .map_err(|e| format!("Unable to write {}: {e}", path.display()))
}

fn parse_network_info(text: &str) -> Result<SocketAddr, String> {
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let line = line.split('#').next().unwrap_or_default();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "ip_address" => {
                ip = Some(
                    value
                        .parse()
                        .map_err(|e| format!("Bad ip_address `{value}`: {e}"))?,
                )
            }
            "port" => {
                port = Some(
                    value
                        .parse()
                        .map_err(|e| format!("Bad port `{value}`: {e}"))?,
                )
            }
            _ => {}
        }
    }

    match (ip, port) {
        (Some(ip), Some(port)) => Ok(SocketAddr::new(ip, port)),
        (None, _) => Err("Missing ip_address".to_string()),
        (_, None) => Err("Missing port".to_string()),
    }
}

fn render_network_info(addr: SocketAddr) -> String {
    let mut out = String::from("# File holding network information for external communications\n");
    let _ = writeln!(out, "ip_address={}", addr.ip());
    let _ = writeln!(out, "port={}", addr.port());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_skips_comments() {
        let text = "# header\nip_address=10.0.0.7 # the pi\n#port=1\nport=12346\n";
        assert_eq!(
            parse_network_info(text).unwrap(),
            "10.0.0.7:12346".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn missing_port_is_reported() {
        assert!(parse_network_info("ip_address=10.0.0.7\n")
            .unwrap_err()
            .contains("port"));
    }

    #[test]
    fn rendered_file_reads_back() {
        let addr: SocketAddr = "127.0.0.1:4321".parse().unwrap();
        assert_eq!(parse_network_info(&render_network_info(addr)).unwrap(), addr);
    }
}
