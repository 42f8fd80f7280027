//! Dashboard rendering: peers sorted slowest-first, one 80-column line per
//! peer with an inline bar of spaces proportional to its average latency.

use std::net::Ipv4Addr;

use crate::store::{Host, Protocol, ALL_PROTOCOLS};

pub const CONSOLE_WIDTH: usize = 80;
pub const CONSOLE_HEIGHT: usize = 24;

/// Render the dashboard lines from a store snapshot.
///
/// Line format: `IP  SP×k  L_UDP L_TCP L_ICMP`. The space run doubles as a
/// bar chart: the widest line on screen fixes the maximum bar width, and
/// each row's bar scales with its average latency relative to the slowest
/// peer. Peers with no samples rank as infinitely slow and take the full
/// bar.
pub fn render_lines(mut entries: Vec<(Ipv4Addr, Host)>) -> Vec<String> {
    entries.sort_by(|a, b| b.1.average_latency().total_cmp(&a.1.average_latency()));

    let mut ips = Vec::with_capacity(entries.len());
    let mut cells = Vec::with_capacity(entries.len());
    let mut min_space = CONSOLE_WIDTH;
    let mut max_average = 0f64;

    for (addr, host) in &entries {
        let ip = addr.to_string();
        let times = ALL_PROTOCOLS
            .map(|protocol| latency_cell(host, protocol))
            .join(" ");

        match CONSOLE_WIDTH.checked_sub(ip.len() + times.len() + 1) {
            Some(available) => min_space = min_space.min(available),
            None => min_space = 1,
        }
        min_space = min_space.max(1);
        max_average = max_average.max(host.average_latency());

        ips.push(ip);
        cells.push(times);
    }

    entries
        .iter()
        .enumerate()
        .map(|(i, (_, host))| {
            let average = host.average_latency();
            let ratio = if average >= max_average {
                1.0
            } else if max_average.is_finite() && max_average > 0.0 {
                average / max_average
            } else {
                0.0
            };
            let bar = ((ratio * min_space as f64).round() as usize).clamp(1, min_space);
            format!("{}{}{}", ips[i], " ".repeat(bar), cells[i])
        })
        .collect()
}

/// One latency column: `-` while the protocol is unavailable, `?` while
/// available but unsampled, otherwise the integer microseconds.
fn latency_cell(host: &Host, protocol: Protocol) -> String {
    if !host.is_protocol_available(protocol) {
        return "-".to_string();
    }
    match host.latency(protocol) {
        Some(micros) => micros.to_string(),
        None => "?".to_string(),
    }
}

/// The window of rendered lines a client at `top_row` sees.
pub fn visible_range(total_rows: usize, top_row: usize) -> std::ops::Range<usize> {
    let max_row = total_rows.min(top_row + CONSOLE_HEIGHT);
    let min_row = if max_row <= CONSOLE_HEIGHT {
        0
    } else {
        max_row - CONSOLE_HEIGHT
    };
    min_row..max_row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LatencyStore;
    use std::time::{Duration, Instant};

    fn snapshot_with(
        peers: &[(Ipv4Addr, &[(Protocol, u64)])],
        now: Instant,
    ) -> Vec<(Ipv4Addr, Host)> {
        let store = LatencyStore::new();
        let ttl = Duration::from_secs(600);
        for (addr, samples) in peers {
            store.set_connection_available_at(Protocol::Udp, *addr, ttl, now);
            store.set_connection_available_at(Protocol::Tcp, *addr, ttl, now);
            for &(protocol, micros) in *samples {
                store.add_latency_at(protocol, *addr, Duration::from_micros(micros), now);
            }
        }
        store.get_all_at(now)
    }

    #[test]
    fn ranking_is_slowest_first_with_unsampled_on_top() {
        let now = Instant::now();
        let p1 = Ipv4Addr::new(10, 0, 0, 1);
        let p2 = Ipv4Addr::new(10, 0, 0, 2);
        let p3 = Ipv4Addr::new(10, 0, 0, 3);

        let entries = snapshot_with(
            &[
                (p1, &[(Protocol::Udp, 500)]),
                (p2, &[(Protocol::Udp, 100), (Protocol::Tcp, 200)]),
                (p3, &[]),
            ],
            now,
        );
        let lines = render_lines(entries);

        assert!(lines[0].starts_with("10.0.0.3"));
        assert!(lines[1].starts_with("10.0.0.1"));
        assert!(lines[2].starts_with("10.0.0.2"));
    }

    #[test]
    fn cells_mark_unavailable_and_unsampled_protocols() {
        let now = Instant::now();
        let peer = Ipv4Addr::new(10, 0, 0, 1);

        let store = LatencyStore::new();
        store.set_connection_available_at(Protocol::Udp, peer, Duration::from_secs(600), now);
        store.add_latency_at(Protocol::Udp, peer, Duration::from_micros(42), now);
        let entries = store.get_all_at(now);

        let line = render_lines(entries).remove(0);
        // columns: UDP (sampled), TCP (unavailable), ICMP (available, unsampled)
        assert!(line.ends_with("42 - ?"), "unexpected line: {line:?}");
    }

    #[test]
    fn longest_line_fills_the_console_width() {
        let now = Instant::now();
        let entries = snapshot_with(
            &[
                (Ipv4Addr::new(10, 0, 0, 1), &[(Protocol::Udp, 400)]),
                (Ipv4Addr::new(10, 0, 0, 2), &[(Protocol::Udp, 100)]),
            ],
            now,
        );
        let lines = render_lines(entries);

        assert_eq!(lines[0].len(), CONSOLE_WIDTH - 1);
        assert!(lines[1].len() < CONSOLE_WIDTH - 1);
    }

    #[test]
    fn bars_scale_with_average_latency() {
        let now = Instant::now();
        let entries = snapshot_with(
            &[
                (Ipv4Addr::new(10, 0, 0, 1), &[(Protocol::Udp, 400)]),
                (Ipv4Addr::new(10, 0, 0, 2), &[(Protocol::Udp, 200)]),
                (Ipv4Addr::new(10, 0, 0, 3), &[(Protocol::Udp, 100)]),
            ],
            now,
        );
        let lines = render_lines(entries);

        let bar = |line: &str| {
            line.chars()
                .skip_while(|c| *c != ' ')
                .take_while(|c| *c == ' ')
                .count()
        };
        let widest = bar(&lines[0]);
        assert_eq!(bar(&lines[1]), (widest as f64 / 2.0).round() as usize);
        assert_eq!(bar(&lines[2]), (widest as f64 / 4.0).round() as usize);
    }

    #[test]
    fn every_bar_is_at_least_one_space() {
        let now = Instant::now();
        let entries = snapshot_with(
            &[
                (Ipv4Addr::new(10, 0, 0, 1), &[(Protocol::Udp, 1_000_000)]),
                (Ipv4Addr::new(10, 0, 0, 2), &[(Protocol::Udp, 1)]),
            ],
            now,
        );
        let lines = render_lines(entries);
        assert!(lines[1].contains("10.0.0.2 "));
    }

    #[test]
    fn visible_range_windows() {
        assert_eq!(visible_range(30, 0), 0..24);
        assert_eq!(visible_range(30, 6), 6..30);
        assert_eq!(visible_range(10, 0), 0..10);
        assert_eq!(visible_range(0, 0), 0..0);
    }
}
