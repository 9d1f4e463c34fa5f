use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kiln_core::ResolvedRunConfig;
use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
};

/// External experiment tracking. Only ever initialized by the leader.
pub trait ExperimentTracker: Send + Sync {
    fn init(
        &self,
        project: &str,
        config: &ResolvedRunConfig,
        run_id: &str,
        tags: &[String],
    ) -> Result<Box<dyn TrackerRun>>;
}

pub trait TrackerRun: Send {
    fn log(&mut self, epoch: u64, iteration: u64, metrics: &[(&str, f64)]) -> Result<()>;
}

/// Tracks runs as plain files: `run.json` with the run description and
/// `metrics.jsonl` with one line per logged step.
pub struct FileTracker {
    root: PathBuf,
}

impl FileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[derive(Serialize)]
struct RunDescription<'a> {
    project: &'a str,
    run_id: &'a str,
    tags: &'a [String],
    started_at: DateTime<Utc>,
    config: &'a ResolvedRunConfig,
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    time: DateTime<Utc>,
    epoch: u64,
    iteration: u64,
    #[serde(flatten)]
    metrics: std::collections::BTreeMap<&'a str, f64>,
}

impl ExperimentTracker for FileTracker {
    fn init(
        &self,
        project: &str,
        config: &ResolvedRunConfig,
        run_id: &str,
        tags: &[String],
    ) -> Result<Box<dyn TrackerRun>> {
        let dir = self.root.join(project).join(run_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating tracker directory {}", dir.display()))?;
        let description = RunDescription {
            project,
            run_id,
            tags,
            started_at: Utc::now(),
            config,
        };
        std::fs::write(
            dir.join("run.json"),
            serde_json::to_vec_pretty(&description)?,
        )
        .context("writing run.json")?;
        let metrics = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))
            .context("opening metrics.jsonl")?;
        Ok(Box::new(FileTrackerRun { metrics }))
    }
}

struct FileTrackerRun {
    metrics: File,
}

impl TrackerRun for FileTrackerRun {
    fn log(&mut self, epoch: u64, iteration: u64, metrics: &[(&str, f64)]) -> Result<()> {
        let line = MetricsLine {
            time: Utc::now(),
            epoch,
            iteration,
            metrics: metrics.iter().copied().collect(),
        };
        serde_json::to_writer(&mut self.metrics, &line)?;
        self.metrics.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{ConfigResolver, HostProfile, RawRunConfig};

    #[test]
    fn writes_description_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            ConfigResolver::resolve(&RawRunConfig::default(), &HostProfile::cpu_only(2)).unwrap();
        let tracker = FileTracker::new(dir.path());
        let mut run = tracker
            .init("kiln", &config, "run_1", &["backbone".to_string()])
            .unwrap();
        run.log(0, 10, &[("loss", 0.5)]).unwrap();
        run.log(1, 20, &[("loss", 0.25)]).unwrap();

        let run_dir = dir.path().join("kiln/run_1");
        let description: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("run.json")).unwrap()).unwrap();
        assert_eq!(description["tags"][0], "backbone");
        assert_eq!(description["config"]["run_label"], "run_1");

        let metrics = std::fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = metrics
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["iteration"], 20);
        assert_eq!(lines[1]["loss"], 0.25);
    }
}
