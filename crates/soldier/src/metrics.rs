use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// Soldier counters, rendered in Prometheus text format.
#[derive(Default)]
pub struct Metrics {
    pub orders_received_total: AtomicU64,
    pub orders_undecodable_total: AtomicU64,
    pub missions_completed_total: AtomicU64,
    pub missions_failed_total: AtomicU64,
    pub status_published_total: AtomicU64,
    pub status_publish_errors_total: AtomicU64,
    pub token_refresh_ok_total: AtomicU64,
    pub token_refresh_failed_total: AtomicU64,
    pub missions_in_flight: AtomicU64,
    pub missions_in_flight_peak: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enter_flight(&self) {
        let now = self.missions_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.missions_in_flight_peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn leave_flight(&self) {
        self.missions_in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |x| Some(x.saturating_sub(1)))
            .ok();
    }

    pub fn in_flight_peak(&self) -> u64 {
        self.missions_in_flight_peak.load(Ordering::SeqCst)
    }

    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let mut metric = |kind: &str, name: &str, value: &AtomicU64| {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            out.push_str(&format!("{name} {}\n", value.load(Ordering::Relaxed)));
        };
        metric("counter", "soldier_orders_received_total", &self.orders_received_total);
        metric("counter", "soldier_orders_undecodable_total", &self.orders_undecodable_total);
        metric("counter", "soldier_missions_completed_total", &self.missions_completed_total);
        metric("counter", "soldier_missions_failed_total", &self.missions_failed_total);
        metric("counter", "soldier_status_published_total", &self.status_published_total);
        metric(
            "counter",
            "soldier_status_publish_errors_total",
            &self.status_publish_errors_total,
        );
        metric("counter", "soldier_token_refresh_ok_total", &self.token_refresh_ok_total);
        metric(
            "counter",
            "soldier_token_refresh_failed_total",
            &self.token_refresh_failed_total,
        );
        metric("gauge", "soldier_missions_in_flight", &self.missions_in_flight);
        metric("gauge", "soldier_missions_in_flight_peak", &self.missions_in_flight_peak);
        out
    }
}

/// Minimal HTTP listener answering `GET /metrics`. Runs until aborted.
pub async fn serve_metrics(metrics: Arc<Metrics>, bind_addr: SocketAddr) {
    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(address=%bind_addr, error=%e, "metrics server bind failed");
            return;
        }
    };
    info!(address=%bind_addr, "metrics server listening");
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                let m = metrics.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    let _ = tokio::time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await;
                    let req = String::from_utf8_lossy(&buf);
                    let path = req
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/");

                    let (status_line, body) = if path.starts_with("/metrics") {
                        ("HTTP/1.1 200 OK", m.render_prometheus())
                    } else {
                        ("HTTP/1.1 404 Not Found", "not found\n".to_string())
                    };
                    let resp = format!(
                        "{status_line}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
            Err(e) => {
                warn!(error=%e, "metrics accept failed");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_highest_in_flight() {
        let m = Metrics::new();
        m.enter_flight();
        m.enter_flight();
        m.leave_flight();
        m.enter_flight();
        m.leave_flight();
        m.leave_flight();
        m.leave_flight();
        assert_eq!(m.missions_in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(m.in_flight_peak(), 2);
        let text = m.render_prometheus();
        assert!(text.contains("# TYPE soldier_missions_in_flight gauge\n"));
        assert!(text.contains("soldier_missions_in_flight_peak 2\n"));
    }

    #[tokio::test]
    async fn listener_serves_metrics() {
        let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let m = Arc::new(Metrics::new());
        Metrics::inc(&m.orders_received_total);
        let server = tokio::spawn(serve_metrics(m, addr));

        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(mut s) = tokio::net::TcpStream::connect(addr).await {
                s.write_all(b"GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
                s.read_to_string(&mut body).await.unwrap();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        server.abort();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("soldier_orders_received_total 1\n"));
    }
}
