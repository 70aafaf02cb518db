//! Integration tests for the mock devices and for streams built on them.

use acq_core::capabilities::{names, DataObserver, Detector, Parameterized, Scanner, TriggerMode};
use acq_core::data::DataArray;
use acq_core::parameter::Parameter;
use acq_core::stream::{SettingRole, Stream};
use acq_driver_mock::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Collect(mpsc::UnboundedSender<DataArray>);

impl DataObserver for Collect {
    fn on_data(&self, data: DataArray) {
        let _ = self.0.send(data);
    }
}

fn rig(pixel_event: bool) -> (Arc<MockScanner>, Arc<MockScanDetector>, Arc<MockDetector>) {
    let scanner = Arc::new(MockScanner::builder().pixel_event(pixel_event).build());
    let se = Arc::new(MockScanDetector::new("se", scanner.clone()));
    let ccd = Arc::new(
        MockDetector::builder("ccd")
            .kind(DetectorKind::Image(4, 4))
            .exposure_time(0.002)
            .hardware_trigger(true)
            .probe(scanner.probe())
            .build(),
    );
    (scanner, se, ccd)
}

#[test]
fn test_capabilities_resolved_once() {
    let (scanner, se, ccd) = rig(true);
    let se_stream = Stream::builder("SE", se, scanner.clone()).fuzzing(true).build();
    let ccd_stream = Stream::builder("CCD", ccd, scanner).build();

    let caps = se_stream.capabilities();
    assert!(caps.scan_driven && caps.fuzzing && !caps.hardware_trigger);
    assert!(se_stream.policy().fuzzing);

    let caps = ccd_stream.capabilities();
    assert!(caps.hardware_trigger && caps.integration && !caps.scan_driven);
}

#[test]
fn test_fuzzing_dropped_when_unsupported() {
    let (scanner, _, ccd) = rig(false);
    let stream = Stream::builder("CCD", ccd, scanner).fuzzing(true).build();
    assert!(!stream.policy().fuzzing);
    assert!(!stream.capabilities().hardware_trigger);
}

#[tokio::test]
async fn test_local_settings_linked_only_while_active() {
    let (scanner, _, ccd) = rig(false);
    let stream = Stream::builder("CCD", ccd.clone(), scanner)
        .local_detector_settings(&[names::EXPOSURE_TIME])
        .build();
    let hw: Parameter<f64> = ccd.parameters().get_typed(names::EXPOSURE_TIME).unwrap();
    let local = stream
        .local_settings(SettingRole::Detector)
        .get(names::EXPOSURE_TIME)
        .unwrap();

    local.set_json(serde_json::json!(0.05)).unwrap();
    assert_eq!(hw.get(), 0.002);

    stream.set_active(true);
    assert!(stream.is_active());
    assert_eq!(hw.get(), 0.05);

    local.set_json(serde_json::json!(0.07)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hw.get(), 0.07);

    stream.set_active(false);
    local.set_json(serde_json::json!(0.09)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hw.get(), 0.07);
}

#[tokio::test]
async fn test_managed_settings_not_pushed() {
    let (scanner, _, ccd) = rig(false);
    let stream = Stream::builder("CCD", ccd.clone(), scanner)
        .local_detector_settings(&[names::EXPOSURE_TIME])
        .build();
    stream
        .local_settings(SettingRole::Detector)
        .get(names::EXPOSURE_TIME)
        .unwrap()
        .set_json(serde_json::json!(0.3))
        .unwrap();
    stream.link_local_settings(&[names::EXPOSURE_TIME]);
    assert!((ccd.exposure().unwrap() - 0.002).abs() < 1e-12);
    stream.unlink_local_settings();
}

#[tokio::test]
async fn test_hardware_clamp_reflected_locally() {
    let (scanner, _, _) = rig(false);
    let ccd = Arc::new(MockDetector::builder("ccd").max_exposure(0.1).build());
    let stream = Stream::builder("CCD", ccd.clone(), scanner)
        .local_detector_settings(&[names::EXPOSURE_TIME])
        .build();
    let local = stream
        .local_settings(SettingRole::Detector)
        .get(names::EXPOSURE_TIME)
        .unwrap();
    local.set_json(serde_json::json!(0.5)).unwrap();
    stream.set_active(true);
    assert_eq!(local.get_json().unwrap(), serde_json::json!(0.1));
    stream.set_active(false);
}

#[tokio::test]
async fn test_hardware_trigger_follows_raster() {
    let (scanner, se, ccd) = rig(true);
    let params = scanner.parameters();
    params.get_typed::<(u32, u32)>(names::RESOLUTION).unwrap().set((3, 2)).unwrap();
    params.get_typed::<f64>(names::DWELL_TIME).unwrap().set(0.005).unwrap();
    params.get_typed::<bool>(names::PIXEL_TRIGGER).unwrap().set(true).unwrap();

    let event = scanner.pixel_event().unwrap();
    let ccd_flow = ccd.data_flow();
    ccd_flow.synchronize_on(TriggerMode::Hardware(event)).await.unwrap();
    let (tx, mut frames) = mpsc::unbounded_channel();
    ccd_flow.subscribe(Arc::new(Collect(tx))).await.unwrap();

    let se_flow = se.data_flow();
    se_flow.synchronize_on(TriggerMode::Software).await.unwrap();
    let (tx, mut raster) = mpsc::unbounded_channel();
    se_flow.subscribe(Arc::new(Collect(tx))).await.unwrap();
    se_flow.trigger().await.unwrap();

    let image = tokio::time::timeout(Duration::from_secs(2), raster.recv()).await.unwrap().unwrap();
    assert_eq!(image.shape(), &[2, 3]);
    for _ in 0..6 {
        let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv()).await.unwrap().unwrap();
        assert_eq!(frame.shape(), &[4, 4]);
    }
}

#[tokio::test]
async fn test_dropped_frames_never_delivered() {
    let det = MockDetector::builder("ccd")
        .exposure_time(0.001)
        .values(ValueSource::Sequence)
        .error_config(ErrorConfig::scenario(ErrorScenario::DropFrames { after: 1, count: 1 }))
        .build();
    let flow = det.data_flow();
    flow.synchronize_on(TriggerMode::Software).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    flow.subscribe(Arc::new(Collect(tx))).await.unwrap();
    for _ in 0..3 {
        flow.trigger().await.unwrap();
    }
    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.mean(), 0.0);
    assert_eq!(second.mean(), 2.0);
}

#[test]
fn test_config_deserialization() {
    let cfg: MockDetectorConfig =
        serde_json::from_value(serde_json::json!({"kind": {"spectrum": 16}, "max_exposure": 0.2}))
            .unwrap();
    assert_eq!(cfg.kind, DetectorKind::Spectrum(16));
    assert!((cfg.exposure_time - 0.01).abs() < 1e-12);

    let scanner: MockScannerConfig =
        serde_json::from_value(serde_json::json!({"pixel_event": true})).unwrap();
    assert!(scanner.pixel_event);
    assert_eq!(scanner.shape, (512, 512));
}
