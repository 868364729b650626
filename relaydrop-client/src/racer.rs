//! Connection racing across candidate addresses
//!
//! Every (candidate, port) pair is dialed concurrently, bounded by a
//! semaphore. The first successful dial wins an atomic flag; every other
//! attempt is aborted and the task set is drained before `race` returns, so
//! no losing socket outlives the race.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info};

use crate::candidates::Candidate;

/// Error type returned by a [`Dialer`]
pub type DialError = Box<dyn std::error::Error + Send + Sync>;

/// Opens one connection to a target address
#[async_trait::async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn dial(&self, target: SocketAddr) -> Result<Self::Connection, DialError>;
}

/// How candidates are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum RaceStrategy {
    /// Private addresses alone for a short window, then everything
    #[default]
    LanFirst,
    /// Every candidate at once
    MaximumReliability,
}

/// Race tuning
#[derive(Debug, Clone)]
pub struct RaceConfig {
    pub per_attempt_timeout: Duration,
    pub overall_deadline: Duration,
    pub max_concurrent: usize,
    pub strategy: RaceStrategy,
    /// How long LAN candidates race alone under [`RaceStrategy::LanFirst`]
    pub lan_window: Duration,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            per_attempt_timeout: Duration::from_secs(3),
            overall_deadline: Duration::from_secs(10),
            max_concurrent: 16,
            strategy: RaceStrategy::LanFirst,
            lan_window: Duration::from_millis(750),
        }
    }
}

/// One dial target derived from a candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub candidate: Candidate,
    pub target: SocketAddr,
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.target, self.candidate.source)
    }
}

/// The connection that won a race
pub struct RaceWinner<C> {
    pub connection: C,
    pub attempt: Attempt,
    pub elapsed: Duration,
}

impl<C> fmt::Debug for RaceWinner<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaceWinner")
            .field("attempt", &self.attempt)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum RaceError {
    #[error("all {} candidate attempts failed", attempted.len())]
    AllCandidatesFailed { attempted: Vec<Attempt> },
}

/// Expand candidates into dial targets
///
/// A candidate's own port comes first, then each shared port; repeated
/// targets are tried once.
pub fn expand_attempts(candidates: &[Candidate], ports: &[u16]) -> Vec<Attempt> {
    let mut attempts: Vec<Attempt> = Vec::new();
    for candidate in candidates {
        for port in candidate.port.iter().chain(ports) {
            let target = SocketAddr::new(candidate.address, *port);
            if !attempts.iter().any(|a| a.target == target) {
                attempts.push(Attempt {
                    candidate: candidate.clone(),
                    target,
                });
            }
        }
    }
    attempts
}

/// Race every candidate/port pair and return the first connection
///
/// # Errors
///
/// Returns [`RaceError::AllCandidatesFailed`] when no attempt succeeds before
/// the overall deadline (or there was nothing to try).
pub async fn race<D: Dialer>(
    candidates: &[Candidate],
    ports: &[u16],
    config: &RaceConfig,
    dialer: Arc<D>,
) -> Result<RaceWinner<D::Connection>, RaceError> {
    let attempts = expand_attempts(candidates, ports);
    let started = Instant::now();
    let deadline = started + config.overall_deadline;

    let winner = match config.strategy {
        RaceStrategy::MaximumReliability => {
            run_round(attempts.clone(), deadline, config, dialer).await
        }
        RaceStrategy::LanFirst => {
            let lan: Vec<Attempt> = attempts
                .iter()
                .filter(|a| a.candidate.is_lan())
                .cloned()
                .collect();
            let lan_round = if !lan.is_empty() && lan.len() < attempts.len() {
                let lan_deadline = deadline.min(started + config.lan_window);
                run_round(lan, lan_deadline, config, dialer.clone()).await
            } else {
                None
            };
            match lan_round {
                Some(winner) => Some(winner),
                None => run_round(attempts.clone(), deadline, config, dialer).await,
            }
        }
    };

    match winner {
        Some((attempt, connection)) => {
            let elapsed = started.elapsed();
            info!(addr = %attempt, ?elapsed, "connection race won");
            Ok(RaceWinner {
                connection,
                attempt,
                elapsed,
            })
        }
        None => Err(RaceError::AllCandidatesFailed {
            attempted: attempts,
        }),
    }
}

/// Dial `attempts` concurrently until one succeeds or `deadline` passes
async fn run_round<D: Dialer>(
    attempts: Vec<Attempt>,
    deadline: Instant,
    config: &RaceConfig,
    dialer: Arc<D>,
) -> Option<(Attempt, D::Connection)> {
    if attempts.is_empty() {
        return None;
    }

    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let decided = Arc::new(AtomicBool::new(false));
    let per_attempt = config.per_attempt_timeout;
    let mut set = JoinSet::new();

    for attempt in attempts {
        let permits = permits.clone();
        let decided = decided.clone();
        let dialer = dialer.clone();
        set.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            if decided.load(Ordering::Acquire) {
                return None;
            }
            match timeout(per_attempt, dialer.dial(attempt.target)).await {
                Ok(Ok(connection)) => {
                    if decided
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        Some((attempt, connection))
                    } else {
                        debug!(addr = %attempt, "late connection dropped");
                        None
                    }
                }
                Ok(Err(e)) => {
                    debug!(addr = %attempt, error = %e, "attempt failed");
                    None
                }
                Err(_) => {
                    debug!(addr = %attempt, "attempt timed out");
                    None
                }
            }
        });
    }

    let winner = timeout_at(deadline, async {
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(winner)) = joined {
                return Some(winner);
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    set.abort_all();
    // An attempt can claim the win just as the deadline passes; its
    // connection is only seen while draining. Every other late one is dropped.
    let mut winner = winner;
    while let Some(joined) = set.join_next().await {
        if let Ok(Some(late)) = joined {
            if winner.is_none() {
                debug!(addr = %late.0, "connection claimed at the deadline kept");
                winner = Some(late);
            }
        }
    }

    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::atomic::AtomicUsize;

    use tokio::net::{TcpListener, TcpStream};

    use crate::candidates::CandidateSource;

    /// Counts live sockets so tests can prove losers were released
    struct Tracked {
        live: Arc<AtomicUsize>,
        target: SocketAddr,
    }

    impl Tracked {
        fn open(live: &Arc<AtomicUsize>, target: SocketAddr) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self {
                live: live.clone(),
                target,
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed(Duration),
        Fail,
        Hang,
        /// Completes without yielding, holding its worker thread meanwhile
        Block(Duration),
    }

    struct MockDialer {
        behaviors: HashMap<SocketAddr, Behavior>,
        live: Arc<AtomicUsize>,
        dialed: AtomicUsize,
    }

    impl MockDialer {
        fn new(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
            Arc::new(Self {
                behaviors: behaviors
                    .iter()
                    .map(|(addr, b)| (addr.parse().unwrap(), *b))
                    .collect(),
                live: Arc::new(AtomicUsize::new(0)),
                dialed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl Dialer for MockDialer {
        type Connection = Tracked;

        async fn dial(&self, target: SocketAddr) -> Result<Tracked, DialError> {
            self.dialed.fetch_add(1, Ordering::SeqCst);
            // The socket exists while the handshake is in flight
            let socket = Tracked::open(&self.live, target);
            match self.behaviors.get(&target).copied().unwrap_or(Behavior::Fail) {
                Behavior::Succeed(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(socket)
                }
                Behavior::Fail => Err("connection refused".into()),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Block(duration) => {
                    std::thread::sleep(duration);
                    Ok(socket)
                }
            }
        }
    }

    fn candidate(ip: &str, source: CandidateSource) -> Candidate {
        Candidate::new(ip.parse().unwrap(), None, source)
    }

    fn config(strategy: RaceStrategy) -> RaceConfig {
        RaceConfig {
            per_attempt_timeout: Duration::from_secs(2),
            overall_deadline: Duration::from_secs(5),
            max_concurrent: 8,
            strategy,
            lan_window: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_expand_attempts() {
        let candidates = [
            Candidate::new("10.0.0.2".parse().unwrap(), Some(9000), CandidateSource::UpnpMapped),
            candidate("10.0.0.3", CandidateSource::Local),
        ];
        let targets: Vec<String> = expand_attempts(&candidates, &[7600, 9000])
            .iter()
            .map(|a| a.target.to_string())
            .collect();
        assert_eq!(
            targets,
            ["10.0.0.2:9000", "10.0.0.2:7600", "10.0.0.3:7600", "10.0.0.3:9000"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lan_wins_and_stun_attempt_is_cancelled() {
        let dialer = MockDialer::new(&[
            ("192.168.1.5:7600", Behavior::Succeed(Duration::from_millis(20))),
            ("203.0.113.9:7600", Behavior::Hang),
        ]);
        let candidates = [
            candidate("203.0.113.9", CandidateSource::StunPublic),
            candidate("192.168.1.5", CandidateSource::Local),
        ];

        for strategy in [RaceStrategy::LanFirst, RaceStrategy::MaximumReliability] {
            let winner = race(&candidates, &[7600], &config(strategy), dialer.clone())
                .await
                .unwrap();
            assert_eq!(winner.attempt.target, "192.168.1.5:7600".parse().unwrap());
            assert_eq!(winner.connection.target, winner.attempt.target);
            assert!(winner.elapsed < Duration::from_secs(5));
            // Only the winner's socket is still open
            assert_eq!(dialer.live.load(Ordering::SeqCst), 1);
            drop(winner);
            assert_eq!(dialer.live.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_wins_and_slower_successes_are_dropped() {
        let dialer = MockDialer::new(&[
            ("10.0.0.1:7600", Behavior::Succeed(Duration::from_millis(300))),
            ("10.0.0.2:7600", Behavior::Succeed(Duration::from_millis(100))),
            ("10.0.0.3:7600", Behavior::Succeed(Duration::from_millis(200))),
        ]);
        let candidates = [
            candidate("10.0.0.1", CandidateSource::Local),
            candidate("10.0.0.2", CandidateSource::Local),
            candidate("10.0.0.3", CandidateSource::Local),
        ];

        let winner = race(
            &candidates,
            &[7600],
            &config(RaceStrategy::MaximumReliability),
            dialer.clone(),
        )
        .await
        .unwrap();
        assert_eq!(winner.attempt.target, "10.0.0.2:7600".parse().unwrap());
        assert_eq!(dialer.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_failed_reports_attempts() {
        let dialer = MockDialer::new(&[
            ("10.0.0.1:7600", Behavior::Fail),
            ("203.0.113.9:7600", Behavior::Hang),
        ]);
        let candidates = [
            candidate("10.0.0.1", CandidateSource::Local),
            candidate("203.0.113.9", CandidateSource::StunPublic),
        ];

        let started = Instant::now();
        let err = race(&candidates, &[7600], &config(RaceStrategy::LanFirst), dialer.clone())
            .await
            .unwrap_err();
        let RaceError::AllCandidatesFailed { attempted } = err;
        assert_eq!(attempted.len(), 2);
        // Bounded by the per-attempt timeout, not the overall deadline
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(dialer.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_win_claimed_past_the_deadline_is_returned() {
        // The dial claims the win after the round's deadline has fired
        let dialer = MockDialer::new(&[(
            "10.0.0.7:7600",
            Behavior::Block(Duration::from_millis(300)),
        )]);
        let config = RaceConfig {
            overall_deadline: Duration::from_millis(100),
            ..config(RaceStrategy::MaximumReliability)
        };

        let winner = race(
            &[candidate("10.0.0.7", CandidateSource::Local)],
            &[7600],
            &config,
            dialer.clone(),
        )
        .await
        .unwrap();
        assert_eq!(winner.attempt.target, "10.0.0.7:7600".parse().unwrap());
        assert_eq!(dialer.live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let dialer = MockDialer::new(&[]);
        let err = race(&[], &[7600], &config(RaceStrategy::LanFirst), dialer.clone())
            .await
            .unwrap_err();
        let RaceError::AllCandidatesFailed { attempted } = err;
        assert!(attempted.is_empty());
        assert_eq!(dialer.dialed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_bounds_hanging_attempts() {
        let dialer = MockDialer::new(&[("203.0.113.9:7600", Behavior::Hang)]);
        let config = RaceConfig {
            per_attempt_timeout: Duration::from_secs(60),
            overall_deadline: Duration::from_secs(5),
            ..config(RaceStrategy::MaximumReliability)
        };

        let started = Instant::now();
        let result = race(
            &[candidate("203.0.113.9", CandidateSource::StunPublic)],
            &[7600],
            &config,
            dialer.clone(),
        )
        .await;
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(dialer.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let behaviors: Vec<(String, Behavior)> = (1..=6)
            .map(|i| (format!("10.0.0.{i}:7600"), Behavior::Hang))
            .collect();
        let refs: Vec<(&str, Behavior)> =
            behaviors.iter().map(|(a, b)| (a.as_str(), *b)).collect();
        let dialer = MockDialer::new(&refs);
        let candidates: Vec<Candidate> = (1..=6)
            .map(|i| candidate(&format!("10.0.0.{i}"), CandidateSource::Local))
            .collect();
        let config = RaceConfig {
            max_concurrent: 2,
            per_attempt_timeout: Duration::from_secs(1),
            overall_deadline: Duration::from_millis(1500),
            ..config(RaceStrategy::MaximumReliability)
        };

        assert!(race(&candidates, &[7600], &config, dialer.clone()).await.is_err());
        // Two in the first second, two more before the deadline
        assert_eq!(dialer.dialed.load(Ordering::SeqCst), 4);
        assert_eq!(dialer.live.load(Ordering::SeqCst), 0);
    }

    /// Plain TCP connect, for racing against real sockets
    struct TcpDialer;

    #[async_trait::async_trait]
    impl Dialer for TcpDialer {
        type Connection = TcpStream;

        async fn dial(&self, target: SocketAddr) -> Result<TcpStream, DialError> {
            Ok(TcpStream::connect(target).await?)
        }
    }

    #[tokio::test]
    async fn test_real_listener_beats_unroutable_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let candidates = [
            // TEST-NET-3, never answers
            candidate("203.0.113.1", CandidateSource::StunPublic),
            candidate("127.0.0.1", CandidateSource::Local),
        ];

        let winner = race(
            &candidates,
            &[port],
            &config(RaceStrategy::LanFirst),
            Arc::new(TcpDialer),
        )
        .await
        .unwrap();
        assert_eq!(winner.attempt.target.ip(), IpAddr::from([127, 0, 0, 1]));
        assert!(winner.elapsed < Duration::from_secs(5));
    }
}
