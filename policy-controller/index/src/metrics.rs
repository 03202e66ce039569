use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Index-size gauges, refreshed by the reconciler after every event.
#[derive(Clone, Debug, Default)]
pub struct Sizes(Arc<Inner>);

#[derive(Debug, Default)]
struct Inner {
    network_policies: AtomicU64,
    address_sgs: AtomicU64,
    applied_to_sgs: AtomicU64,
    trackers: AtomicU64,
    cloud_rules: AtomicU64,
}

impl Sizes {
    pub(crate) fn record(
        &self,
        network_policies: usize,
        address_sgs: usize,
        applied_to_sgs: usize,
        trackers: usize,
        cloud_rules: usize,
    ) {
        self.0
            .network_policies
            .store(network_policies as u64, Ordering::Relaxed);
        self.0.address_sgs.store(address_sgs as u64, Ordering::Relaxed);
        self.0
            .applied_to_sgs
            .store(applied_to_sgs as u64, Ordering::Relaxed);
        self.0.trackers.store(trackers as u64, Ordering::Relaxed);
        self.0.cloud_rules.store(cloud_rules as u64, Ordering::Relaxed);
    }
}

pub fn register(reg: &mut Registry, sizes: Sizes) {
    reg.register_collector(Box::new(Instrumented(sizes)));
}

#[derive(Debug)]
struct Instrumented(Sizes);

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let gauges = [
            (
                "network_policy_index_size",
                "The number of network policies in the index",
                self.0 .0.network_policies.load(Ordering::Relaxed),
            ),
            (
                "address_security_group_index_size",
                "The number of address security groups in the index",
                self.0 .0.address_sgs.load(Ordering::Relaxed),
            ),
            (
                "applied_to_security_group_index_size",
                "The number of appliedTo security groups in the index",
                self.0 .0.applied_to_sgs.load(Ordering::Relaxed),
            ),
            (
                "cloud_resource_tracker_index_size",
                "The number of cloud-resource policy trackers in the index",
                self.0 .0.trackers.load(Ordering::Relaxed),
            ),
            (
                "cloud_rule_index_size",
                "The number of realized cloud rules in the index",
                self.0 .0.cloud_rules.load(Ordering::Relaxed),
            ),
        ];
        for (name, help, value) in gauges {
            let gauge = ConstGauge::new(value as i64);
            let gauge_encoder = encoder.encode_descriptor(name, help, None, MetricType::Gauge)?;
            gauge.encode(gauge_encoder)?;
        }
        Ok(())
    }
}
