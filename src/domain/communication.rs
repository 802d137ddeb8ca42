use serde::Serialize;

use crate::domain::call_pattern::CallRelation;
use crate::domain::fusion::{CallMode, FusionGroup, group_of};

/// Channel kind chosen for one cross-group relation.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Direct,
    SyncRemoteCall,
    Event,
    AsyncGatewayCall,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SerializationFormat {
    Json,
    CompactBinary,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionKind {
    None,
    Gzip,
    Zstd,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthOverlay {
    None,
    Iam,
    SignedToken,
}

/// Advisory channel configuration for one cross-group relation. Attached to
/// the optimization result; never changes the engine's join semantics.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CommunicationConfig {
    pub source_group: String,
    pub target_group: String,
    pub caller: String,
    pub callee: String,
    pub channel: ChannelKind,
    pub serialization: SerializationFormat,
    pub compression: CompressionKind,
    pub auth: AuthOverlay,

    /// Estimator sample for the chosen channel, when an estimator ran.
    pub sample: Option<CommunicationSample>,
}

#[derive(Debug, Clone)]
pub struct CommunicationPolicy {
    /// Relations above this call count use the compact binary format and
    /// the stronger compression on remote channels.
    pub high_volume_threshold: u64,

    /// Payload size fed into the channel estimator.
    pub payload_size_kb: f64,
}

impl Default for CommunicationPolicy {
    fn default() -> Self {
        CommunicationPolicy { high_volume_threshold: 1_000, payload_size_kb: 16.0 }
    }
}

/// Sample returned by the communication estimator collaborator.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CommunicationSample {
    pub latency_ms: f64,
    pub cost: f64,
    pub details: String,
}

/// Communication estimator collaborator.
pub trait CommunicationEstimator: std::fmt::Debug + Send + Sync {
    fn simulate(&self, channel: ChannelKind, payload_size_kb: f64, call_count: u64) -> CommunicationSample;
}

/// Default channel model: a per-channel base latency plus a payload transfer
/// share, costed per million calls.
#[derive(Debug, Clone)]
pub struct SimulatedCommunicationEstimator {
    pub transfer_ms_per_kb: f64,
    pub cost_per_million_calls: f64,
}

impl Default for SimulatedCommunicationEstimator {
    fn default() -> Self {
        SimulatedCommunicationEstimator { transfer_ms_per_kb: 0.05, cost_per_million_calls: 0.40 }
    }
}

impl CommunicationEstimator for SimulatedCommunicationEstimator {
    fn simulate(&self, channel: ChannelKind, payload_size_kb: f64, call_count: u64) -> CommunicationSample {
        let base_ms = match channel {
            ChannelKind::Direct => 0.1,
            ChannelKind::Event => 5.0,
            ChannelKind::SyncRemoteCall => 25.0,
            ChannelKind::AsyncGatewayCall => 40.0,
        };
        let latency_ms = base_ms + payload_size_kb * self.transfer_ms_per_kb;
        let cost = if channel == ChannelKind::Direct { 0.0 } else { call_count as f64 / 1_000_000.0 * self.cost_per_million_calls };
        CommunicationSample { latency_ms, cost, details: format!("{:?} x{} @ {:.1} kB", channel, call_count, payload_size_kb) }
    }
}

/// Policy table keyed by (locality, dominant mode).
fn channel_for(is_local: bool, mode: CallMode) -> ChannelKind {
    match (is_local, mode) {
        (true, CallMode::Sync) => ChannelKind::Direct,
        (false, CallMode::Sync) => ChannelKind::SyncRemoteCall,
        (true, CallMode::Async) => ChannelKind::Event,
        (false, CallMode::Async) => ChannelKind::AsyncGatewayCall,
    }
}

/// **Communication phase (optional):** advisory channel selection for every
/// relation that crosses a group boundary.
///
/// Locality is decided by the units' regions; group-internal relations never
/// get a config because member calls are plain in-process invocations.
pub fn optimize_communication(
    groups: &[FusionGroup],
    relations: &[CallRelation],
    policy: &CommunicationPolicy,
    estimator: Option<&dyn CommunicationEstimator>,
    region_of: impl Fn(&str) -> Option<String>,
) -> Vec<CommunicationConfig> {
    let mut configs = Vec::new();

    for relation in relations {
        let (Some(source_group), Some(target_group)) = (group_of(groups, &relation.caller), group_of(groups, &relation.callee)) else {
            log::debug!("Relation {} -> {} touches units outside the partition; skipping", relation.caller, relation.callee);
            continue;
        };
        if source_group.key() == target_group.key() {
            continue;
        }

        let is_local = match (region_of(&relation.caller), region_of(&relation.callee)) {
            (Some(source_region), Some(target_region)) => source_region == target_region,
            _ => {
                log::warn!("Missing region for relation {} -> {}; treating hop as remote", relation.caller, relation.callee);
                false
            }
        };

        let mode = relation.dominant_mode();
        let channel = channel_for(is_local, mode);
        let high_volume = relation.call_count > policy.high_volume_threshold;

        let serialization = if high_volume { SerializationFormat::CompactBinary } else { SerializationFormat::Json };

        let compression = match channel {
            ChannelKind::Direct => CompressionKind::None,
            _ if high_volume => CompressionKind::Zstd,
            _ => CompressionKind::Gzip,
        };

        let auth = match channel {
            ChannelKind::Direct => AuthOverlay::None,
            ChannelKind::SyncRemoteCall | ChannelKind::Event => AuthOverlay::Iam,
            ChannelKind::AsyncGatewayCall => AuthOverlay::SignedToken,
        };

        let sample = estimator.map(|e| e.simulate(channel, policy.payload_size_kb, relation.call_count));

        configs.push(CommunicationConfig {
            source_group: source_group.key(),
            target_group: target_group.key(),
            caller: relation.caller.clone(),
            callee: relation.callee.clone(),
            channel,
            serialization,
            compression,
            auth,
            sample,
        });
    }

    configs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(caller: &str, callee: &str, sync: u64, asyn: u64, count: u64) -> CallRelation {
        CallRelation { caller: caller.to_string(), callee: callee.to_string(), call_count: count, sync_count: sync, async_count: asyn }
    }

    fn groups() -> Vec<FusionGroup> {
        vec![
            FusionGroup::new(vec!["a".to_string(), "b".to_string()]),
            FusionGroup::new(vec!["c".to_string()]),
            FusionGroup::new(vec!["d".to_string()]),
        ]
    }

    fn same_region(_: &str) -> Option<String> {
        Some("eu-central-1".to_string())
    }

    #[test]
    fn intra_group_relations_get_no_config() {
        let configs = optimize_communication(&groups(), &[relation("a", "b", 5, 0, 5)], &CommunicationPolicy::default(), None, same_region);
        assert!(configs.is_empty());
    }

    #[test]
    fn policy_table_maps_locality_and_mode() {
        let relations = vec![relation("b", "c", 5, 0, 5), relation("b", "d", 0, 5, 5)];

        let local = optimize_communication(&groups(), &relations, &CommunicationPolicy::default(), None, same_region);
        assert_eq!(local[0].channel, ChannelKind::Direct);
        assert_eq!(local[1].channel, ChannelKind::Event);

        let remote_region = |unit: &str| Some(if unit == "b" { "eu-central-1" } else { "us-east-1" }.to_string());
        let remote = optimize_communication(&groups(), &relations, &CommunicationPolicy::default(), None, remote_region);
        assert_eq!(remote[0].channel, ChannelKind::SyncRemoteCall);
        assert_eq!(remote[1].channel, ChannelKind::AsyncGatewayCall);
    }

    #[test]
    fn high_volume_switches_serialization_and_compression() {
        let policy = CommunicationPolicy { high_volume_threshold: 10, ..CommunicationPolicy::default() };
        let remote_region = |unit: &str| Some(if unit == "b" { "eu-central-1" } else { "us-east-1" }.to_string());

        let low = optimize_communication(&groups(), &[relation("b", "c", 5, 0, 5)], &policy, None, remote_region);
        assert_eq!(low[0].serialization, SerializationFormat::Json);
        assert_eq!(low[0].compression, CompressionKind::Gzip);

        let high = optimize_communication(&groups(), &[relation("b", "c", 50, 0, 50)], &policy, None, remote_region);
        assert_eq!(high[0].serialization, SerializationFormat::CompactBinary);
        assert_eq!(high[0].compression, CompressionKind::Zstd);
    }

    #[test]
    fn direct_channel_carries_no_compression_or_auth() {
        let configs =
            optimize_communication(&groups(), &[relation("b", "c", 9_999, 0, 9_999)], &CommunicationPolicy::default(), None, same_region);
        assert_eq!(configs[0].channel, ChannelKind::Direct);
        assert_eq!(configs[0].compression, CompressionKind::None);
        assert_eq!(configs[0].auth, AuthOverlay::None);
    }

    #[test]
    fn estimator_samples_are_attached_per_config() {
        let estimator = SimulatedCommunicationEstimator::default();
        let remote_region = |unit: &str| Some(if unit == "b" { "eu-central-1" } else { "us-east-1" }.to_string());

        let configs =
            optimize_communication(&groups(), &[relation("b", "c", 5, 0, 5)], &CommunicationPolicy::default(), Some(&estimator), remote_region);
        let sample = configs[0].sample.as_ref().unwrap();
        assert!(sample.latency_ms > 0.0);
        assert!(sample.cost > 0.0);

        // Direct hops are free in the model.
        let direct = estimator.simulate(ChannelKind::Direct, 16.0, 1_000);
        assert_eq!(direct.cost, 0.0);
        assert!(direct.latency_ms < sample.latency_ms);
    }
}
