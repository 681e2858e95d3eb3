//! Host address discovery and hotspot gateway selection.

use std::net::Ipv4Addr;

use crate::error::Result;
use crate::exec::CommandRunner;

/// Global IPv4 addresses of the host.
///
/// # Command Executed
/// ```bash
/// ip -4 -o addr show scope global
/// ```
pub fn host_addresses(runner: &dyn CommandRunner) -> Result<Vec<Ipv4Addr>> {
    let output = runner
        .run("ip", &["-4", "-o", "addr", "show", "scope", "global"])?
        .into_result("ip")?;
    Ok(parse_addresses(&output.stdout))
}

/// Interface carrying the default route, if any.
///
/// # Command Executed
/// ```bash
/// ip route show default
/// ```
pub fn default_route_interface(runner: &dyn CommandRunner) -> Result<Option<String>> {
    let output = runner
        .run("ip", &["route", "show", "default"])?
        .into_result("ip")?;
    Ok(parse_default_route(&output.stdout))
}

fn parse_addresses(stdout: &str) -> Vec<Ipv4Addr> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet")?;
            tokens.next()?.split('/').next()?.parse().ok()
        })
        .collect()
}

fn parse_default_route(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "dev")?;
        tokens.next().map(str::to_string)
    })
}

/// Picks a hotspot gateway whose /24 cannot collide with the host's addresses.
///
/// A host on 10/8 gets `10.N.0.1` starting at N = 42, otherwise
/// `192.168.N.1` starting at N = 12. N is skipped while any host address in
/// the same private block has N as its third octet.
pub fn choose_gateway(host: &[Ipv4Addr]) -> Ipv4Addr {
    let on_ten = host.iter().any(|a| a.octets()[0] == 10);

    if on_ten {
        let n = first_free(42, |n| {
            host.iter()
                .filter(|a| a.octets()[0] == 10)
                .any(|a| a.octets()[2] == n)
        });
        Ipv4Addr::new(10, n, 0, 1)
    } else {
        let n = first_free(12, |n| {
            host.iter()
                .filter(|a| a.octets()[..2] == [192, 168])
                .any(|a| a.octets()[2] == n)
        });
        Ipv4Addr::new(192, 168, n, 1)
    }
}

fn first_free(start: u8, taken: impl Fn(u8) -> bool) -> u8 {
    (start..=254).find(|n| !taken(*n)).unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::{FakeRunner, ok};

    #[test]
    fn test_parse_ip_output() {
        let addr = "\
2: eth0    inet 10.1.7.20/16 brd 10.1.255.255 scope global dynamic eth0\\       valid_lft 85000sec
3: wlan0    inet 192.168.1.44/24 brd 192.168.1.255 scope global wlan0\\       valid_lft forever
";
        assert_eq!(
            parse_addresses(addr),
            vec![Ipv4Addr::new(10, 1, 7, 20), Ipv4Addr::new(192, 168, 1, 44)]
        );
        assert_eq!(
            parse_default_route("default via 192.168.1.1 dev wlan0 proto dhcp metric 600\n").as_deref(),
            Some("wlan0")
        );
        assert_eq!(parse_default_route(""), None);
    }

    #[test]
    fn test_gateway_on_ten_network() {
        assert_eq!(choose_gateway(&[Ipv4Addr::new(10, 1, 7, 20)]), Ipv4Addr::new(10, 42, 0, 1));
        assert_eq!(choose_gateway(&[Ipv4Addr::new(10, 3, 42, 9)]), Ipv4Addr::new(10, 43, 0, 1));
        assert_eq!(choose_gateway(&[Ipv4Addr::new(10, 42, 5, 3)]), Ipv4Addr::new(10, 42, 0, 1));
        assert_eq!(
            choose_gateway(&[Ipv4Addr::new(10, 1, 42, 2), Ipv4Addr::new(10, 9, 43, 2)]),
            Ipv4Addr::new(10, 44, 0, 1)
        );
    }

    #[test]
    fn test_gateway_on_home_network() {
        assert_eq!(choose_gateway(&[]), Ipv4Addr::new(192, 168, 12, 1));
        assert_eq!(choose_gateway(&[Ipv4Addr::new(192, 168, 1, 5)]), Ipv4Addr::new(192, 168, 12, 1));
        assert_eq!(
            choose_gateway(&[Ipv4Addr::new(192, 168, 12, 5), Ipv4Addr::new(192, 168, 13, 2)]),
            Ipv4Addr::new(192, 168, 14, 1)
        );
    }

    #[test]
    fn test_host_addresses_through_runner() {
        let fake = FakeRunner::new();
        fake.on(
            "ip -4 -o addr show scope global",
            ok("2: eth0    inet 10.0.42.3/24 brd 10.0.42.255 scope global eth0\n"),
        );
        let host = host_addresses(&fake).unwrap();
        assert_eq!(choose_gateway(&host), Ipv4Addr::new(10, 43, 0, 1));
    }
}
