//! Live data assembly.
//!
//! Frames are folded into one full-grid buffer per (stream, auxiliary index)
//! as they arrive. The buffer is allocated from the first frame and never
//! resized; its layout follows the frame shape:
//!
//! | frame        | layout           | buffer shape     |
//! |--------------|------------------|------------------|
//! | one value    | [`Layout::Point`]    | `Y × X`          |
//! | `C` values   | [`Layout::Spectrum`] | `C × Y × X`      |
//! | `h × w`      | [`Layout::Tile`]     | `Y × X × h × w`  |
//!
//! The acquisition task is the only writer ([`LiveAssembler`]); the preview
//! reads projections through a cloned [`LiveStore`] and may see a partially
//! written buffer.

use crate::geometry::ScanGrid;
use acq_core::data::{DataArray, Metadata};
use acq_core::error::{AcqError, AcqResult};
use ndarray::{Array2, ArrayD, ArrayView4, ArrayViewMutD, Axis, Ix4, IxDyn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Per-position shape of a live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One value per position.
    Point,
    /// One spectrum of `C` channels per position.
    Spectrum(usize),
    /// One `h × w` block per position.
    Tile(usize, usize),
}

impl Layout {
    fn from_shape(shape: &[usize]) -> AcqResult<Self> {
        let len: usize = shape.iter().product();
        match shape {
            _ if len == 1 => Ok(Layout::Point),
            [c] => Ok(Layout::Spectrum(*c)),
            [h, w] => Ok(Layout::Tile(*h, *w)),
            other => Err(AcqError::Processing(format!(
                "Unsupported frame shape {:?}",
                other
            ))),
        }
    }

    fn buffer_shape(&self, rows: usize, cols: usize) -> Vec<usize> {
        match *self {
            Layout::Point => vec![rows, cols],
            Layout::Spectrum(c) => vec![c, rows, cols],
            Layout::Tile(h, w) => vec![rows, cols, h, w],
        }
    }

    fn accepts(&self, shape: &[usize]) -> bool {
        match *self {
            Layout::Point => shape.iter().product::<usize>() == 1,
            Layout::Spectrum(c) => shape == [c],
            Layout::Tile(h, w) => shape == [h, w],
        }
    }

    /// Dimension labels of the final array.
    pub fn dims(&self) -> &'static str {
        match self {
            Layout::Spectrum(_) => "CYX",
            _ => "YX",
        }
    }
}

/// Full-grid buffer of one stream at one auxiliary position.
#[derive(Debug, Clone)]
pub struct LiveBuffer {
    /// Index of the stream in the request.
    pub stream: usize,
    /// Auxiliary sequence index.
    pub aux: usize,
    /// Per-position layout.
    pub layout: Layout,
    /// Accumulated values (sum over sub-exposures).
    pub data: ArrayD<f64>,
    /// Sub-exposures accumulated per position (`Y × X`).
    pub counts: Array2<u32>,
    /// Metadata derived from the first frame and the grid.
    pub metadata: Metadata,
    integration: u32,
    last_index: Option<usize>,
}

impl LiveBuffer {
    /// Positions whose integration is complete.
    pub fn mask(&self) -> Array2<bool> {
        let needed = self.integration.max(1);
        self.counts.mapv(|c| c >= needed)
    }

    /// Whether at least one position is complete.
    pub fn has_data(&self) -> bool {
        self.mask().iter().any(|&done| done)
    }

    /// Values averaged over the sub-exposures actually taken.
    pub fn averaged(&self) -> ArrayD<f64> {
        let mut out = self.data.clone();
        for ((y, x), &n) in self.counts.indexed_iter() {
            if n > 1 {
                position_mut(self.layout, &mut out, y, x).mapv_inplace(|v| v / n as f64);
            }
        }
        out
    }

    /// Averaged values of the complete positions only. A position whose
    /// integration was cut short reads zero, like one never reached.
    pub fn completed(&self) -> ArrayD<f64> {
        let mut out = self.averaged();
        let needed = self.integration.max(1);
        for ((y, x), &n) in self.counts.indexed_iter() {
            if n > 0 && n < needed {
                position_mut(self.layout, &mut out, y, x).fill(0.0);
            }
        }
        out
    }

    /// 2-D view for display: points as-is, spectra summed over channels,
    /// tiles reassembled into one mosaic.
    pub fn projection(&self) -> AcqResult<Array2<f64>> {
        let averaged = self.averaged();
        let image = match self.layout {
            Layout::Point => averaged.into_dimensionality::<ndarray::Ix2>(),
            Layout::Spectrum(_) => averaged.sum_axis(Axis(0)).into_dimensionality::<ndarray::Ix2>(),
            Layout::Tile(_, _) => {
                let tiles = averaged
                    .into_dimensionality::<Ix4>()
                    .map_err(|e| AcqError::Processing(e.to_string()))?;
                return mosaic(tiles.view());
            }
        };
        image.map_err(|e| AcqError::Processing(e.to_string()))
    }
}

/// Values of grid position `(y, x)` inside a buffer laid out as `layout`.
pub(crate) fn position_mut(layout: Layout, data: &mut ArrayD<f64>, y: usize, x: usize) -> ArrayViewMutD<'_, f64> {
    match layout {
        Layout::Spectrum(_) => data.view_mut().index_axis_move(Axis(2), x).index_axis_move(Axis(1), y),
        Layout::Point | Layout::Tile(_, _) => data.view_mut().index_axis_move(Axis(0), y).index_axis_move(Axis(0), x),
    }
}

/// Reassemble a `Y × X × h × w` grid of tiles into a `(Y·h) × (X·w)` image
/// by block transposition, keeping row and column adjacency.
pub fn mosaic(tiles: ArrayView4<'_, f64>) -> AcqResult<Array2<f64>> {
    let (rows, cols, h, w) = tiles.dim();
    tiles
        .permuted_axes([0, 2, 1, 3])
        .as_standard_layout()
        .into_owned()
        .into_shape((rows * h, cols * w))
        .map_err(|e| AcqError::Processing(format!("Tile reassembly: {}", e)))
}

/// Read-only view handed to the preview.
#[derive(Debug, Clone)]
pub struct LivePreview {
    /// Stream index.
    pub stream: usize,
    /// Auxiliary index.
    pub aux: usize,
    /// 2-D projection.
    pub image: Array2<f64>,
    /// Acquired positions.
    pub mask: Array2<bool>,
    /// Buffer metadata.
    pub metadata: Metadata,
}

/// Shared, read-mostly handle on the live buffers.
#[derive(Clone, Default)]
pub struct LiveStore {
    buffers: Arc<RwLock<BTreeMap<(usize, usize), LiveBuffer>>>,
    changed: Arc<Notify>,
    version: Arc<AtomicU64>,
}

impl std::fmt::Debug for LiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStore")
            .field("buffers", &self.buffers.read().len())
            .field("version", &self.version())
            .finish()
    }
}

impl LiveStore {
    /// Notified after every update.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Incremented after every update.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Number of allocated buffers.
    pub fn len(&self) -> usize {
        self.buffers.read().len()
    }

    /// Whether nothing was allocated yet.
    pub fn is_empty(&self) -> bool {
        self.buffers.read().is_empty()
    }

    /// Projections of the latest buffer of every stream (highest auxiliary
    /// index written so far).
    pub fn snapshot(&self) -> Vec<LivePreview> {
        let buffers = self.buffers.read();
        let mut latest: BTreeMap<usize, &LiveBuffer> = BTreeMap::new();
        for ((stream, _), buffer) in buffers.iter() {
            latest.insert(*stream, buffer);
        }
        latest
            .into_values()
            .filter_map(|b| {
                b.projection().ok().map(|image| LivePreview {
                    stream: b.stream,
                    aux: b.aux,
                    image,
                    mask: b.mask(),
                    metadata: b.metadata.clone(),
                })
            })
            .collect()
    }

    fn touch(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.changed.notify_one();
    }

    fn take(&self) -> Vec<LiveBuffer> {
        let taken = std::mem::take(&mut *self.buffers.write());
        taken.into_values().collect()
    }
}

/// Single writer of the live buffers of one acquisition.
#[derive(Debug)]
pub struct LiveAssembler {
    store: LiveStore,
    grid: ScanGrid,
    streams: Vec<String>,
    integration: u32,
    current_aux: usize,
    aux_labels: Vec<Option<String>>,
}

impl LiveAssembler {
    /// Assembler for `streams` over `grid`, expecting `integration`
    /// sub-exposures per position.
    pub fn new(grid: ScanGrid, streams: Vec<String>, integration: u32) -> Self {
        Self {
            store: LiveStore::default(),
            grid,
            streams,
            integration: integration.max(1),
            current_aux: 0,
            aux_labels: Vec::new(),
        }
    }

    /// Handle for readers.
    pub fn store(&self) -> LiveStore {
        self.store.clone()
    }

    /// The scan grid.
    pub fn grid(&self) -> &ScanGrid {
        &self.grid
    }

    /// Names of the streams, by index.
    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Sub-exposures expected per position.
    pub fn integration(&self) -> u32 {
        self.integration
    }

    /// Record the label of auxiliary position `aux`.
    pub fn set_aux_label(&mut self, aux: usize, label: impl Into<String>) {
        if self.aux_labels.len() <= aux {
            self.aux_labels.resize(aux + 1, None);
        }
        self.aux_labels[aux] = Some(label.into());
    }

    /// Whether any position is complete.
    pub fn has_data(&self) -> bool {
        self.store.buffers.read().values().any(LiveBuffer::has_data)
    }

    fn check_aux(&mut self, aux: usize) -> AcqResult<()> {
        if aux < self.current_aux {
            return Err(AcqError::Processing(format!(
                "Data for auxiliary index {} arrived after index {}",
                aux, self.current_aux
            )));
        }
        self.current_aux = aux;
        Ok(())
    }

    fn new_buffer(&self, stream: usize, aux: usize, layout: Layout, first: &DataArray, index: usize) -> LiveBuffer {
        let (rows, cols) = self.grid.shape();
        let geometry = self.grid.geometry();
        let pxs = geometry.pixel_size;

        // Center from the first frame's own position and its offset in the grid.
        let center = match (first.metadata.position, self.grid.position(index)) {
            (Some(p), Some(g)) => {
                let c = geometry.center();
                (p.0 + c.0 - g.0, p.1 + c.1 - g.1)
            }
            _ => geometry.center(),
        };
        let pixel_size = match layout {
            Layout::Tile(h, w) => (pxs / w as f64, pxs / h as f64),
            _ => (pxs, pxs),
        };
        let metadata = Metadata {
            description: self.streams.get(stream).cloned(),
            position: Some(center),
            pixel_size: Some(pixel_size),
            dims: Some(layout.dims().to_string()),
            aux_position: self.aux_labels.get(aux).cloned().flatten(),
            ..first.metadata.clone()
        };
        debug!(
            stream = ?self.streams.get(stream),
            aux,
            layout = ?layout,
            rows,
            cols,
            "Live buffer allocated"
        );
        LiveBuffer {
            stream,
            aux,
            layout,
            data: ArrayD::zeros(IxDyn(&layout.buffer_shape(rows, cols))),
            counts: Array2::zeros((rows, cols)),
            metadata,
            integration: self.integration,
            last_index: None,
        }
    }

    /// Fold the frame of grid position `index` into its buffer. Sub-exposures
    /// of the same position are summed.
    pub fn push(&mut self, stream: usize, aux: usize, index: usize, frame: &DataArray) -> AcqResult<()> {
        self.check_aux(aux)?;
        if index >= self.grid.len() {
            return Err(AcqError::Processing(format!(
                "Index {} outside a grid of {} positions",
                index,
                self.grid.len()
            )));
        }
        let (y, x) = self.grid.row_col(index);
        let mut buffers = self.store.buffers.write();
        let buffer = match buffers.entry((stream, aux)) {
            std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::btree_map::Entry::Vacant(e) => {
                let layout = Layout::from_shape(frame.shape())?;
                e.insert(self.new_buffer(stream, aux, layout, frame, index))
            }
        };

        if buffer.last_index.is_some_and(|last| index < last) {
            return Err(AcqError::Processing(format!(
                "Position {} arrived after position {}",
                index,
                buffer.last_index.unwrap_or_default()
            )));
        }
        if !buffer.layout.accepts(frame.shape()) {
            return Err(AcqError::Processing(format!(
                "Frame shape {:?} does not match {:?}",
                frame.shape(),
                buffer.layout
            )));
        }

        match buffer.layout {
            Layout::Point => {
                let value = frame.data.iter().next().copied().unwrap_or(0.0);
                buffer.data[IxDyn(&[y, x])] += value;
            }
            Layout::Spectrum(_) => {
                let mut target = buffer.data.index_axis_mut(Axis(2), x).index_axis_move(Axis(1), y);
                target += &frame.data;
            }
            Layout::Tile(_, _) => {
                let mut target = buffer.data.index_axis_mut(Axis(0), y).index_axis_move(Axis(0), x);
                target += &frame.data;
            }
        }
        buffer.counts[[y, x]] += 1;
        buffer.last_index = Some(index);
        drop(buffers);
        self.store.touch();
        Ok(())
    }

    /// Fold a raster covering the whole grid (hardware-triggered mode).
    pub fn fold_raster(&mut self, stream: usize, aux: usize, raster: &DataArray) -> AcqResult<()> {
        self.check_aux(aux)?;
        let (rows, cols) = self.grid.shape();
        if raster.shape() != [rows, cols] {
            return Err(AcqError::Processing(format!(
                "Raster shape {:?} does not match the {}x{} grid",
                raster.shape(),
                cols,
                rows
            )));
        }
        let mut buffer = self.new_buffer(stream, aux, Layout::Point, raster, 0);
        if let Some(p) = raster.metadata.position {
            buffer.metadata.position = Some(p);
        }
        if let Some(px) = raster.metadata.pixel_size {
            buffer.metadata.pixel_size = Some(px);
        }
        buffer.data.assign(&raster.data);
        buffer.counts.fill(self.integration);
        buffer.last_index = Some(self.grid.len().saturating_sub(1));
        self.store.buffers.write().insert((stream, aux), buffer);
        self.store.touch();
        Ok(())
    }

    /// Take every buffer, leaving the store empty.
    pub fn into_buffers(self) -> Vec<LiveBuffer> {
        self.store.take()
    }
}
