//! Sharded activation stream
//!
//! Serves fixed-size batches from the logical concatenation of all activation
//! partitions, keeping at most one partition resident between steps (two
//! while a batch straddles a boundary).
//!
//! The bookkeeping is split in two:
//! - [`ShardCursor::advance`] is a pure function of the cursor, the step and
//!   the partition lengths. It returns the next cursor and a [`BatchPlan`]
//!   naming the slices that make up the batch.
//! - [`ActivationStream`] executes plans against a [`PartitionSource`],
//!   loading and releasing partitions as the cursor moves.
//!
//! Trailing examples that do not fill a whole batch are never served.

use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use safetensors::tensor::SafeTensors;
use tracing::{debug, info};

/// Preferred tensor name inside a partition file.
pub const PARTITION_TENSOR: &str = "activations";

/// File name of partition `index`.
pub fn partition_file_name(index: usize) -> String {
    format!("sae_data_{index}.safetensors")
}

/// Read-only access to numbered activation partitions.
pub trait PartitionSource {
    /// Number of partitions P.
    fn n_partitions(&self) -> usize;
    /// Examples held by partition `index`.
    fn partition_len(&self, index: usize) -> usize;
    /// Activation width n shared by all partitions.
    fn width(&self) -> usize;
    /// Load partition `index` as a `[len, n]` tensor.
    fn load(&mut self, index: usize) -> Result<Tensor>;
    /// Called when the stream drops its handle on partition `index`.
    fn release(&mut self, _index: usize) {}
}

/// Position of the stream in the concatenated dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardCursor {
    /// Partition currently resident
    pub partition: usize,
    /// Global index of that partition's first example
    pub partition_start: usize,
    /// Global index of the next example to serve
    pub consumed: usize,
}

impl ShardCursor {
    /// Examples of the current partition already served.
    pub fn offset(&self) -> usize {
        self.consumed - self.partition_start
    }

    /// Plan the batch for `step` and return the cursor after serving it.
    ///
    /// Steps must be requested in order: `step * batch_size` has to equal
    /// `self.consumed`.
    pub fn advance(
        &self,
        step: usize,
        batch_size: usize,
        partition_lens: &[usize],
    ) -> Result<(ShardCursor, BatchPlan)> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let start = step * batch_size;
        anyhow::ensure!(
            start == self.consumed,
            "Step {step} starts at example {start}, but the stream is at example {}",
            self.consumed
        );
        let len = *partition_lens
            .get(self.partition)
            .ok_or_else(|| anyhow::anyhow!("Partition {} does not exist", self.partition))?;

        let local_start = self.offset();
        let local_end = local_start + batch_size;

        if local_end <= len {
            let next = ShardCursor {
                consumed: self.consumed + batch_size,
                ..*self
            };
            let plan = BatchPlan::Within {
                partition: self.partition,
                range: local_start..local_end,
            };
            return Ok((next, plan));
        }

        let next_partition = self.partition + 1;
        let remaining = len - local_start;
        let head_len = batch_size - remaining;
        let Some(&next_len) = partition_lens.get(next_partition) else {
            anyhow::bail!(
                "Batch at step {step} has {remaining} examples, expected {batch_size} \
                 (partition {} is the last one)",
                self.partition
            );
        };
        anyhow::ensure!(
            head_len <= next_len,
            "Batch at step {step} would span more than two partitions \
             (batch_size={batch_size}, partition {next_partition} holds {next_len})"
        );

        let next = ShardCursor {
            partition: next_partition,
            partition_start: self.partition_start + len,
            consumed: self.consumed + batch_size,
        };
        let plan = BatchPlan::Straddle {
            tail_partition: self.partition,
            tail: local_start..len,
            head_partition: next_partition,
            head: 0..head_len,
        };
        Ok((next, plan))
    }
}

/// Which partition slices form one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPlan {
    /// The whole batch lies inside one partition.
    Within { partition: usize, range: Range<usize> },
    /// The batch is the tail of one partition followed by the head of the next.
    Straddle {
        tail_partition: usize,
        tail: Range<usize>,
        head_partition: usize,
        head: Range<usize>,
    },
}

impl BatchPlan {
    pub fn crosses_boundary(&self) -> bool {
        matches!(self, BatchPlan::Straddle { .. })
    }
}

/// Batches of exactly `batch_size` activations drawn sequentially across partitions.
pub struct ActivationStream<S: PartitionSource> {
    source: S,
    partition_lens: Vec<usize>,
    batch_size: usize,
    cursor: ShardCursor,
    current: Tensor,
    crossings: usize,
}

impl<S: PartitionSource> ActivationStream<S> {
    /// Open the stream and load partition 0.
    pub fn new(mut source: S, batch_size: usize) -> Result<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let n_partitions = source.n_partitions();
        anyhow::ensure!(n_partitions > 0, "No activation partitions found");

        let partition_lens: Vec<usize> = (0..n_partitions)
            .map(|i| source.partition_len(i))
            .collect();
        let current = source.load(0).context("Failed to load partition 0")?;

        info!(
            "Activation stream: {} partitions, {} examples, width {}",
            n_partitions,
            partition_lens.iter().sum::<usize>(),
            source.width()
        );

        Ok(Self {
            source,
            partition_lens,
            batch_size,
            cursor: ShardCursor::default(),
            current,
            crossings: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn width(&self) -> usize {
        self.source.width()
    }

    pub fn n_partitions(&self) -> usize {
        self.partition_lens.len()
    }

    /// Examples across all partitions.
    pub fn total_examples(&self) -> usize {
        self.partition_lens.iter().sum()
    }

    /// Full batches available: `floor(total_examples / batch_size)`.
    pub fn total_steps(&self) -> usize {
        self.total_examples() / self.batch_size
    }

    pub fn cursor(&self) -> ShardCursor {
        self.cursor
    }

    /// Partition boundaries crossed so far.
    pub fn crossings(&self) -> usize {
        self.crossings
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Bytes held by the resident partition.
    pub fn memory_usage(&self) -> usize {
        self.current.elem_count() * self.current.dtype().size_in_bytes()
    }

    /// Serve the batch covering `[step * B, (step + 1) * B)` as F32.
    pub fn next_batch(&mut self, step: usize) -> Result<Tensor> {
        let (next, plan) = self
            .cursor
            .advance(step, self.batch_size, &self.partition_lens)?;

        let batch = match plan {
            BatchPlan::Within { range, .. } => self
                .current
                .narrow(0, range.start, range.len())?
                .to_dtype(DType::F32)?,
            BatchPlan::Straddle {
                tail_partition,
                tail,
                head_partition,
                head,
            } => {
                let tail = if tail.is_empty() {
                    None
                } else {
                    Some(
                        self.current
                            .narrow(0, tail.start, tail.len())?
                            .to_dtype(DType::F32)?,
                    )
                };
                self.source.release(tail_partition);
                self.current = self
                    .source
                    .load(head_partition)
                    .with_context(|| format!("Failed to load partition {head_partition}"))?;
                let head = self
                    .current
                    .narrow(0, head.start, head.len())?
                    .to_dtype(DType::F32)?;
                self.crossings += 1;
                debug!(
                    "Step {step}: crossed from partition {tail_partition} into {head_partition}"
                );
                match tail {
                    Some(tail) => Tensor::cat(&[&tail, &head], 0)?,
                    None => head,
                }
            }
        };

        let rows = batch.dim(0)?;
        anyhow::ensure!(
            rows == self.batch_size,
            "Batch at step {step} in partition {} has {rows} examples, expected {}",
            next.partition,
            self.batch_size
        );
        self.cursor = next;
        Ok(batch)
    }
}

/// Header facts of one partition file.
#[derive(Debug, Clone)]
struct PartitionInfo {
    path: PathBuf,
    tensor_name: String,
    len: usize,
    width: usize,
}

/// Partitions stored as `sae_data_<i>.safetensors` in one directory.
pub struct SafetensorsPartitions {
    dir: PathBuf,
    partitions: Vec<PartitionInfo>,
}

impl SafetensorsPartitions {
    /// Discover partitions in `dir` by probing file headers.
    pub fn open(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read activation directory {}", dir.display()))?;

        let mut indices = Vec::new();
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = name
                .strip_prefix("sae_data_")
                .and_then(|rest| rest.strip_suffix(".safetensors"))
                .and_then(|n| n.parse::<usize>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        anyhow::ensure!(
            !indices.is_empty(),
            "No sae_data_<i>.safetensors files in {}",
            dir.display()
        );
        for (expected, &found) in indices.iter().enumerate() {
            anyhow::ensure!(
                expected == found,
                "Partition {expected} missing from {} (found {found})",
                dir.display()
            );
        }

        let partitions = indices
            .iter()
            .map(|&i| read_partition_header(&dir.join(partition_file_name(i))))
            .collect::<Result<Vec<_>>>()?;

        let first = &partitions[0];
        for (i, part) in partitions.iter().enumerate() {
            anyhow::ensure!(
                part.width == first.width,
                "Partition {i} has width {}, partition 0 has {}",
                part.width,
                first.width
            );
            let is_last = i + 1 == partitions.len();
            anyhow::ensure!(
                part.len == first.len || (is_last && part.len <= first.len),
                "Partition {i} holds {} examples, expected {}",
                part.len,
                first.len
            );
        }

        info!(
            "Found {} partitions of {} examples (width {}) in {}",
            partitions.len(),
            first.len,
            first.width,
            dir.display()
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            partitions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Examples per partition, taken from partition 0.
    pub fn examples_per_partition(&self) -> usize {
        self.partitions[0].len
    }
}

impl PartitionSource for SafetensorsPartitions {
    fn n_partitions(&self) -> usize {
        self.partitions.len()
    }

    fn partition_len(&self, index: usize) -> usize {
        self.partitions[index].len
    }

    fn width(&self) -> usize {
        self.partitions[0].width
    }

    fn load(&mut self, index: usize) -> Result<Tensor> {
        let part = self
            .partitions
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("Partition {index} out of range"))?;
        info!("Loading partition {index} from {}", part.path.display());

        // The payload is copied once, from the page cache into the tensor.
        let mmap = map_partition(&part.path)?;
        let st = SafeTensors::deserialize(&mmap)
            .with_context(|| format!("Failed to deserialize {}", part.path.display()))?;
        let view = st.tensor(&part.tensor_name)?;
        tensor_from_view(&view, &Device::Cpu)
    }
}

/// Read-only memory map of one partition file.
fn map_partition(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open partition {}", path.display()))?;
    // SAFETY: partitions are immutable for the lifetime of the run.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map partition {}", path.display()))?;
    Ok(mmap)
}

/// Read shape and tensor name from a partition's header through a memory map.
fn read_partition_header(path: &Path) -> Result<PartitionInfo> {
    let mmap = map_partition(path)?;
    let st = SafeTensors::deserialize(&mmap)
        .with_context(|| format!("Failed to parse header of {}", path.display()))?;

    let names = st.names();
    let tensor_name = if names.iter().any(|n| n.as_str() == PARTITION_TENSOR) {
        PARTITION_TENSOR.to_string()
    } else if names.len() == 1 {
        names[0].to_string()
    } else {
        anyhow::bail!(
            "{} must hold a single tensor or one named '{PARTITION_TENSOR}'",
            path.display()
        );
    };

    let view = st.tensor(&tensor_name)?;
    let shape = view.shape();
    anyhow::ensure!(
        shape.len() == 2,
        "Partition {} has shape {shape:?}, expected [examples, width]",
        path.display()
    );

    Ok(PartitionInfo {
        path: path.to_path_buf(),
        tensor_name,
        len: shape[0],
        width: shape[1],
    })
}

/// Convert a safetensors `TensorView` to a candle `Tensor` on the given device.
fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape: Vec<usize> = view.shape().to_vec();
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!("Unsupported activation dtype: {other:?}"),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, device)?;
    Ok(tensor)
}
