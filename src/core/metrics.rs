/// Prometheus metrics of the managed volumes
///
/// One series per volume in each gauge, labelled by volume id, name, host
/// binding and hostname. Series are created when a volume is discovered and
/// removed when it disappears.

use prometheus::{GaugeVec, Opts, Registry, TextEncoder};

use crate::core::volume::Volume;
use crate::error::Result;

const LABELS: [&str; 4] = ["volume_id", "volume_name", "host_bind", "hostname"];

#[derive(Clone)]
pub struct VolumeMetrics {
    registry: Registry,
    last_backup_date: GaugeVec,
    last_backup_status: GaugeVec,
    oldest_backup_date: GaugeVec,
    backup_count: GaugeVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<GaugeVec> {
    let g = GaugeVec::new(Opts::new(name, help).namespace("bivac"), &LABELS)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn labels(v: &Volume) -> [&str; 4] {
    [
        v.id.as_str(),
        v.name.as_str(),
        v.host_bind.as_str(),
        v.hostname.as_str(),
    ]
}

impl VolumeMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            last_backup_date: gauge(&registry, "last_backup_date", "Date of the last backup")?,
            last_backup_status: gauge(
                &registry,
                "last_backup_status",
                "Status of the last backup (0 success, 1 failed, -1 unknown)",
            )?,
            oldest_backup_date: gauge(&registry, "oldest_backup_date", "Date of the oldest snapshot")?,
            backup_count: gauge(&registry, "backup_count", "Number of snapshots")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create the series of a newly discovered volume
    pub fn register(&self, v: &Volume) {
        let l = labels(v);
        self.last_backup_status
            .with_label_values(&l)
            .set(v.last_backup_status.gauge_value());
        let date = v.last_backup_date.map(|d| d.timestamp() as f64).unwrap_or(0.0);
        self.last_backup_date.with_label_values(&l).set(date);
        self.oldest_backup_date.with_label_values(&l);
        self.backup_count.with_label_values(&l);
    }

    /// Remove the series of a vanished volume. Fails when they were already
    /// removed.
    pub fn unregister(&self, v: &Volume) -> Result<()> {
        let l = labels(v);
        self.last_backup_date.remove_label_values(&l)?;
        self.last_backup_status.remove_label_values(&l)?;
        self.oldest_backup_date.remove_label_values(&l)?;
        self.backup_count.remove_label_values(&l)?;
        Ok(())
    }

    /// Move the series of a volume whose name or host changed, keeping
    /// their values
    pub fn relabel(&self, old: &Volume, new: &Volume) -> Result<()> {
        let (from, to) = (labels(old), labels(new));
        if from == to {
            return Ok(());
        }
        for g in [
            &self.last_backup_date,
            &self.last_backup_status,
            &self.oldest_backup_date,
            &self.backup_count,
        ] {
            let value = g.get_metric_with_label_values(&from)?.get();
            g.remove_label_values(&from)?;
            g.with_label_values(&to).set(value);
        }
        Ok(())
    }

    /// Publish the outcome of a run
    pub fn update(&self, v: &Volume) {
        let l = labels(v);
        self.last_backup_status
            .with_label_values(&l)
            .set(v.last_backup_status.gauge_value());
        if let Some(d) = v.last_backup_date {
            self.last_backup_date.with_label_values(&l).set(d.timestamp() as f64);
        }
    }

    /// Publish what the repository holds
    pub fn set_snapshots(&self, v: &Volume, latest: i64, oldest: i64, count: usize) {
        let l = labels(v);
        self.last_backup_date.with_label_values(&l).set(latest as f64);
        self.oldest_backup_date.with_label_values(&l).set(oldest as f64);
        self.backup_count.with_label_values(&l).set(count as f64);
    }

    /// Text exposition of the volume gauges followed by the process-wide
    /// default registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut families = self.registry.gather();
        families.extend(prometheus::gather());
        Ok(encoder.encode_to_string(&families)?)
    }
}
