//! `acq-sim`: run synchronized acquisitions against simulated hardware.
//!
//! ```bash
//! acq-sim run --repetition 16x12 --aux horizontal,vertical
//! acq-sim run --config sim.toml --hardware-sync
//! RUST_LOG=acq_engine=debug acq-sim run --drift
//! ```
//!
//! The optional configuration file holds an `[engine]` table (see
//! `EngineConfig`) and a `[simulation]` table describing the mock rig and the
//! request. Command-line flags win over the file.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use acq_core::capabilities::Movable;
use acq_core::data::DataArray;
use acq_core::stream::Stream;
use acq_driver_mock::{
    parse_pair, DetectorKind, MockDetector, MockPolarizer, MockScanDetector, MockScanner, MockStage,
};
use acq_engine::{
    AcquisitionHandle, AcquisitionRequest, AnchorDriftCorrector, EngineConfig, Orchestrator, Roi,
    ScanStage,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "acq-sim")]
#[command(about = "Synchronized scan acquisition on simulated hardware", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition and print the result set
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// TOML file with [engine] and [simulation] tables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Grid size, e.g. 4x3
    #[arg(long)]
    repetition: Option<String>,

    /// Clock the detectors on the scanner's pixel event
    #[arg(long)]
    hardware_sync: bool,

    /// Polarizer positions to acquire the grid at, comma separated
    #[arg(long, value_delimiter = ',')]
    aux: Vec<String>,

    /// Simulate specimen drift and correct it on an anchor region
    #[arg(long)]
    drift: bool,

    /// Move the specimen with a stage instead of the beam
    #[arg(long)]
    stage: bool,

    /// Effective exposure per position (s)
    #[arg(long)]
    exposure: Option<f64>,
}

/// The `[simulation]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct SimulationConfig {
    /// Grid, "WxH".
    repetition: String,
    /// Region of interest: left, top, right, bottom.
    roi: Option<[f64; 4]>,
    /// Dwell time per position (s).
    dwell_time: f64,
    /// Effective exposure of the synchronized detector (s).
    exposure_time: f64,
    /// Longest single exposure of the synchronized detector (s).
    max_exposure: f64,
    /// Spectrometer channels; 0 for a point detector.
    spectrum_channels: usize,
    /// Polarizer positions.
    aux: Vec<String>,
    /// Keep one array per auxiliary position for the scan detector.
    keep_separate: bool,
    /// Specimen drift per raster (scanner pixels).
    drift_per_scan: (f64, f64),
    /// Anchor region of the drift corrector.
    anchor_roi: [f64; 4],
    /// Anchor pixel size (m).
    anchor_pixel_size: f64,
    /// Time between two anchor scans.
    #[serde(with = "humantime_serde")]
    drift_period: Duration,
    /// Prefer hardware triggering.
    hardware_sync: bool,
    /// Scan with the stage.
    stage: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            repetition: "8x6".into(),
            roi: None,
            dwell_time: 1e-4,
            exposure_time: 0.005,
            max_exposure: 1.0,
            spectrum_channels: 0,
            aux: Vec::new(),
            keep_separate: true,
            drift_per_scan: (0.0, 0.0),
            anchor_roi: [0.05, 0.05, 0.15, 0.15],
            anchor_pixel_size: 4e-8,
            drift_period: Duration::from_millis(50),
            hardware_sync: false,
            stage: false,
        }
    }
}

impl SimulationConfig {
    /// Defaults, then the `[simulation]` table of `path`, then `ACQ_SIM_`
    /// environment variables.
    fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = figment.merge(Figment::from(Toml::file(path)).focus("simulation"));
        }
        figment
            .merge(Env::prefixed("ACQ_SIM_"))
            .extract()
            .context("Invalid [simulation] configuration")
    }

    /// Command-line flags win over the file.
    fn apply_args(&mut self, args: &RunArgs) {
        if let Some(repetition) = &args.repetition {
            self.repetition.clone_from(repetition);
        }
        if let Some(exposure) = args.exposure {
            self.exposure_time = exposure;
        }
        if !args.aux.is_empty() {
            self.aux.clone_from(&args.aux);
        }
        if args.drift && self.drift_per_scan == (0.0, 0.0) {
            self.drift_per_scan = (0.5, -0.3);
        }
        self.hardware_sync |= args.hardware_sync;
        self.stage |= args.stage;
    }

    fn roi(&self) -> Roi {
        self.roi
            .map_or(Roi::UNDEFINED, |[l, t, r, b]| Roi::new(l, t, r, b))
    }
}

/// Mock devices wired into streams.
struct Rig {
    scanner: Arc<MockScanner>,
    se_detector: Arc<MockScanDetector>,
    streams: Vec<Arc<Stream>>,
    polarizer: Arc<MockPolarizer>,
    stage: ScanStage,
}

fn build_rig(sim: &SimulationConfig) -> Rig {
    let scanner = Arc::new(
        MockScanner::builder()
            .name("ebeam")
            .pixel_event(sim.hardware_sync)
            .drift_per_scan(sim.drift_per_scan.0, sim.drift_per_scan.1)
            .build(),
    );
    let se_detector = Arc::new(MockScanDetector::new("se-detector", scanner.clone()));
    let kind = match sim.spectrum_channels {
        0 => DetectorKind::Point,
        n => DetectorKind::Spectrum(n),
    };
    let detector = Arc::new(
        MockDetector::builder("counter")
            .kind(kind)
            .exposure_time(sim.exposure_time)
            .max_exposure(sim.max_exposure)
            .hardware_trigger(sim.hardware_sync)
            .probe(scanner.probe())
            .build(),
    );
    let se = Stream::builder("Secondary electrons", se_detector.clone(), scanner.clone())
        .keep_separate(sim.keep_separate)
        .build();
    let counter = Stream::builder("Counter", detector, scanner.clone()).build();
    let stage = ScanStage {
        x: Arc::new(MockStage::builder("stage-x").build()) as Arc<dyn Movable>,
        y: Arc::new(MockStage::builder("stage-y").build()) as Arc<dyn Movable>,
    };
    Rig {
        scanner,
        se_detector,
        streams: vec![Arc::new(se), Arc::new(counter)],
        polarizer: Arc::new(MockPolarizer::new("polarizer")),
        stage,
    }
}

fn build_request(sim: &SimulationConfig, rig: &Rig, drift: bool) -> Result<AcquisitionRequest> {
    let (rx, ry) = parse_pair(&sim.repetition).context("Invalid repetition")?;
    let mut request = AcquisitionRequest::new(rig.streams.clone())
        .roi(sim.roi())
        .repetition(rx, ry)
        .dwell_time(sim.dwell_time)
        .exposure_time(sim.exposure_time)
        .hardware_sync(sim.hardware_sync);
    if !sim.aux.is_empty() {
        request = request.aux(rig.polarizer.clone(), sim.aux.clone());
    }
    if sim.stage {
        request = request.scan_stage(rig.stage.clone());
    }
    if drift {
        let [l, t, r, b] = sim.anchor_roi;
        let corrector = AnchorDriftCorrector::new(
            rig.scanner.clone(),
            rig.se_detector.clone(),
            Roi::new(l, t, r, b),
            sim.anchor_pixel_size,
        )
        .with_period(sim.drift_period);
        request = request.leech(Arc::new(corrector));
    }
    Ok(request)
}

fn summarize(data: &[DataArray]) -> Vec<String> {
    data.iter()
        .map(|array| {
            let meta = &array.metadata;
            let mut line = format!(
                "{:<22} shape {:?} mean {:.3}",
                meta.description.as_deref().unwrap_or("?"),
                array.shape(),
                array.mean()
            );
            if let Some(aux) = &meta.aux_position {
                line.push_str(&format!(" at {}", aux));
            }
            if let Some(n) = meta.integration_count {
                line.push_str(&format!(" ({} integrated)", n));
            }
            line
        })
        .collect()
}

/// Log the progress twice a second until the task is done.
async fn report_progress(handle: AcquisitionHandle) {
    let mut updates = handle.subscribe_progress();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if handle.is_done() {
            break;
        }
        let progress = *updates.borrow_and_update();
        let fraction = progress.fraction(chrono::Utc::now());
        info!(
            percent = (fraction * 100.0).round(),
            eta = %progress.end.format("%H:%M:%S"),
            "Acquiring"
        );
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let engine = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };
    let mut sim = SimulationConfig::load(args.config.as_deref())?;
    sim.apply_args(&args);
    info!(?sim, "Simulation configured");

    let rig = build_rig(&sim);
    let request = build_request(&sim, &rig, args.drift)?;
    let orchestrator = Orchestrator::new(engine);
    let estimate = orchestrator.estimate(&request)?;
    info!(estimate_s = estimate.as_secs_f64(), "Estimated acquisition time");

    let handle = orchestrator.acquire(request)?;
    let progress = tokio::spawn(report_progress(handle.clone()));

    let outcome = tokio::select! {
        outcome = handle.result(None) => outcome,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, cancelling");
            handle.cancel();
            handle.result(None).await
        }
    };
    progress.abort();

    let result = outcome?;
    for line in summarize(&result.data) {
        println!("{}", line);
    }
    match result.error {
        None => println!("Acquisition complete: {} arrays", result.data.len()),
        Some(e) => println!("Acquisition stopped early ({}): {} arrays", e, result.data.len()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}
