//! Final data assembly: live buffers to result arrays.
//!
//! Per stream, in request order:
//!
//! - sub-exposures of an integrated acquisition are averaged, the exposure
//!   and dwell times scaled by their count and `integration_count` set
//! - tiles are reassembled by block transposition into one 2-D array
//! - with a single auxiliary position the buffer is returned as is
//! - with several, a `keep_separate` stream yields one array per position,
//!   any other stream the elementwise mean of all positions
//!
//! Only complete positions carry values: a position still missing
//! sub-exposures when the task stopped is zero, and merged positions are
//! averaged over the auxiliary elements that reached them.

use crate::live::{mosaic, position_mut, Layout, LiveBuffer};
use acq_core::data::{DataArray, Metadata};
use acq_core::error::{AcqError, AcqResult};
use ndarray::{ArrayD, Ix4};
use std::collections::BTreeMap;
use tracing::debug;

/// Turn the live buffers of a task into its result set.
///
/// `keep_separate[i]` is the policy of stream `i`; buffers of streams beyond
/// the slice are merged. Buffers without a complete position are skipped,
/// and positions whose integration was cut short read zero.
pub fn assemble(buffers: Vec<LiveBuffer>, keep_separate: &[bool], integration: u32) -> AcqResult<Vec<DataArray>> {
    let mut per_stream: BTreeMap<usize, Vec<LiveBuffer>> = BTreeMap::new();
    for buffer in buffers.into_iter().filter(LiveBuffer::has_data) {
        per_stream.entry(buffer.stream).or_default().push(buffer);
    }

    let mut results = Vec::new();
    for (stream, mut buffers) in per_stream {
        buffers.sort_by_key(|b| b.aux);
        let separate = keep_separate.get(stream).copied().unwrap_or(false);
        if buffers.len() == 1 || separate {
            for buffer in &buffers {
                results.push(finalize_buffer(buffer, integration)?);
            }
        } else {
            debug!(stream, positions = buffers.len(), "Averaging auxiliary positions");
            results.push(merge(&buffers, integration)?);
        }
    }
    Ok(results)
}

fn finalize_buffer(buffer: &LiveBuffer, integration: u32) -> AcqResult<DataArray> {
    let data = to_result_layout(buffer.layout, buffer.completed())?;
    let mut metadata = buffer.metadata.clone();
    scale_by_count(&mut metadata, integration);
    Ok(DataArray::new(data, metadata))
}

fn to_result_layout(layout: Layout, data: ArrayD<f64>) -> AcqResult<ArrayD<f64>> {
    match layout {
        Layout::Tile(_, _) => {
            let tiles = data
                .into_dimensionality::<Ix4>()
                .map_err(|e| AcqError::Processing(e.to_string()))?;
            Ok(mosaic(tiles.view())?.into_dyn())
        }
        Layout::Point | Layout::Spectrum(_) => Ok(data),
    }
}

/// Elementwise mean of the buffers of one stream over its auxiliary
/// positions. Each grid position is averaged over the buffers in which it
/// is complete, so an auxiliary element cut short does not dilute the
/// positions it never reached.
fn merge(buffers: &[LiveBuffer], integration: u32) -> AcqResult<DataArray> {
    let Some((first, rest)) = buffers.split_first() else {
        return Err(AcqError::Processing("Nothing to average".into()));
    };
    let mut sum = first.completed();
    let mut hits = first.mask().mapv(u32::from);
    for buffer in rest {
        if buffer.layout != first.layout || buffer.data.shape() != first.data.shape() {
            return Err(AcqError::Processing(format!(
                "Cannot average buffers of shapes {:?} and {:?}",
                first.data.shape(),
                buffer.data.shape()
            )));
        }
        sum += &buffer.completed();
        hits += &buffer.mask().mapv(u32::from);
    }
    for ((y, x), &n) in hits.indexed_iter() {
        if n > 1 {
            position_mut(first.layout, &mut sum, y, x).mapv_inplace(|v| v / n as f64);
        }
    }

    let mut metadata = first.metadata.clone();
    metadata.aux_position = None;
    scale_by_count(&mut metadata, integration.max(1) * buffers.len() as u32);
    Ok(DataArray::new(to_result_layout(first.layout, sum)?, metadata))
}

fn scale_by_count(metadata: &mut Metadata, count: u32) {
    if count <= 1 {
        return;
    }
    let n = count as f64;
    metadata.exposure_time = metadata.exposure_time.map(|t| t * n);
    metadata.dwell_time = metadata.dwell_time.map(|t| t * n);
    metadata.integration_count = Some(count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Roi, ScanGeometry, ScanGrid};
    use crate::live::LiveAssembler;
    use ndarray::IxDyn;

    fn assembler(streams: usize, integration: u32) -> LiveAssembler {
        let grid = ScanGrid::new(ScanGeometry {
            roi: Roi::FULL,
            repetition: (2, 2),
            pixel_size: 1.0,
            field_of_view: (2.0, 2.0),
        });
        let names = (0..streams).map(|i| format!("s{}", i)).collect();
        LiveAssembler::new(grid, names, integration)
    }

    fn frame(value: f64, exposure: f64) -> DataArray {
        DataArray::point(
            value,
            Metadata {
                exposure_time: Some(exposure),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_single_position_verbatim() {
        let mut live = assembler(1, 1);
        for i in 0..4 {
            live.push(0, 0, i, &frame(i as f64, 0.1)).unwrap();
        }
        let out = assemble(live.into_buffers(), &[false], 1).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].shape(), &[2, 2]);
        assert_eq!(out[0].data[IxDyn(&[1, 0])], 2.0);
        assert_eq!(out[0].metadata.integration_count, None);
        assert_eq!(out[0].metadata.exposure_time, Some(0.1));
    }

    #[test]
    fn test_keep_separate_and_merge() {
        let mut live = assembler(2, 1);
        for aux in 0..3 {
            for i in 0..4 {
                live.push(0, aux, i, &frame(aux as f64, 0.1)).unwrap();
                live.push(1, aux, i, &frame(aux as f64 * 3.0, 0.1)).unwrap();
            }
        }
        let out = assemble(live.into_buffers(), &[true, false], 1).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[2].mean(), 2.0);
        let merged = &out[3];
        assert_eq!(merged.mean(), 3.0);
        assert_eq!(merged.metadata.integration_count, Some(3));
        assert!((merged.metadata.exposure_time.unwrap() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_integration_recorded() {
        let mut live = assembler(1, 3);
        for i in 0..4 {
            for v in [1.0, 2.0, 3.0] {
                live.push(0, 0, i, &frame(v, 0.5)).unwrap();
            }
        }
        let out = assemble(live.into_buffers(), &[false], 3).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].mean(), 2.0);
        assert_eq!(out[0].metadata.integration_count, Some(3));
        assert_eq!(out[0].metadata.exposure_time, Some(1.5));
    }

    #[test]
    fn test_tiles_reassembled() {
        let mut live = assembler(1, 1);
        for i in 0..4 {
            let tile = DataArray::new(ArrayD::from_elem(IxDyn(&[3, 3]), i as f64), Metadata::default());
            live.push(0, 0, i, &tile).unwrap();
        }
        let out = assemble(live.into_buffers(), &[false], 1).unwrap();
        assert_eq!(out[0].shape(), &[6, 6]);
        assert_eq!(out[0].data[IxDyn(&[0, 3])], 1.0);
        assert_eq!(out[0].data[IxDyn(&[5, 0])], 2.0);
        assert_eq!(out[0].metadata.pixel_size, Some((1.0 / 3.0, 1.0 / 3.0)));
    }

    #[test]
    fn test_interrupted_aux_element_does_not_dilute_merge() {
        let mut live = assembler(1, 1);
        for i in 0..4 {
            live.push(0, 0, i, &frame(3.0, 0.1)).unwrap();
        }
        live.push(0, 1, 0, &frame(5.0, 0.1)).unwrap();
        let out = assemble(live.into_buffers(), &[false], 1).unwrap();
        assert_eq!(out.len(), 1);
        let values: Vec<f64> = out[0].data.iter().copied().collect();
        assert_eq!(values, vec![4.0, 3.0, 3.0, 3.0]);
        assert_eq!(out[0].metadata.integration_count, Some(2));
    }

    #[test]
    fn test_cut_short_integration_left_empty() {
        let mut live = assembler(1, 3);
        for v in [1.0, 2.0, 3.0] {
            live.push(0, 0, 0, &frame(v, 0.5)).unwrap();
        }
        live.push(0, 0, 1, &frame(7.0, 0.5)).unwrap();
        let out = assemble(live.into_buffers(), &[false], 3).unwrap();
        assert_eq!(out[0].data[IxDyn(&[0, 0])], 2.0);
        assert_eq!(out[0].data[IxDyn(&[0, 1])], 0.0);
        assert_eq!(out[0].metadata.integration_count, Some(3));
    }

    #[test]
    fn test_cut_short_integration_ignored_in_merge() {
        let mut live = assembler(1, 2);
        for i in 0..4 {
            live.push(0, 0, i, &frame(2.0, 0.1)).unwrap();
            live.push(0, 0, i, &frame(2.0, 0.1)).unwrap();
        }
        live.push(0, 1, 0, &frame(6.0, 0.1)).unwrap();
        live.push(0, 1, 0, &frame(6.0, 0.1)).unwrap();
        live.push(0, 1, 1, &frame(9.0, 0.1)).unwrap();
        let out = assemble(live.into_buffers(), &[false], 2).unwrap();
        let values: Vec<f64> = out[0].data.iter().copied().collect();
        assert_eq!(values, vec![4.0, 2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_empty_buffers_skipped() {
        let live = assembler(1, 1);
        assert!(assemble(live.into_buffers(), &[false], 1).unwrap().is_empty());
    }
}
