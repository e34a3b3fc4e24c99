use tracing::{debug, info};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::types::IceCandidate;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const DEFAULT_FILTER: &str = "peercall_lib=debug,peercall=debug,webrtc=warn";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
/// Returns false when logging is disabled or a subscriber is already set.
pub fn init(enabled: bool) -> bool {
    if !enabled {
        return false;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Trace a trickled candidate
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        kind = cand.candidate_type().unwrap_or("unknown"),
        "trickle candidate"
    );
}

/// Snapshot of the nominated candidate pair from webrtc stats
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

/// Counts host / srflx / relay candidates and warns when no relay exists
pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host = 0;
    let mut srflx = 0;
    let mut relay = 0;

    for candidate in candidates {
        match candidate.candidate_type() {
            Some("host") => host += 1,
            Some("srflx") => srflx += 1,
            Some("relay") => relay += 1,
            _ => {}
        }
    }

    info!(host, srflx, relay, "candidate analysis");
    if relay == 0 && srflx == 0 && host > 0 {
        debug!("only host candidates gathered, peers outside this network may not connect");
    }
}
