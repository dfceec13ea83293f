//! Execution graph for llama-family decoders.
//!
//! The graph is planned once at load: every node's weight range, shape and
//! compiled kernel is resolved up front, so [`ExecutionGraph::forward`] only
//! walks a flat node list. Weights stay encoded in the mapped container and
//! are decoded a row at a time by the matmul kernels.

use std::ops::Range;
use std::sync::Arc;

use crate::memory::{Arena, HostBuffer, KvCache, KvView, Owner};
use crate::models::tensors::{find_output, find_output_norm, find_token_embd, TOKEN_EMBD};
use crate::models::types::QK;
use crate::models::{ContainerError, GgmlType, LayerTensor, ModelContainer, ModelHparams, TensorInfo};

use super::error::EngineError;
use super::flash_attn::{AttnScratch, FlashAttn, FlashAttnConfig};
use super::kernels::{cpu, CompiledKernel, KernelProfile, KernelSet, OpKind};
use super::quantize;

/// Borrowed weight matrix inside the mapped container.
#[derive(Debug, Clone)]
pub struct WeightRef {
    pub name: String,
    pub ty: GgmlType,
    pub rows: usize,
    pub cols: usize,
    range: Range<usize>,
}

impl WeightRef {
    fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.range.clone()]
    }
}

/// Activation buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Buf {
    /// Residual stream.
    Hidden,
    /// Block output folded back into `Hidden`; with it forms the ping-pong pair.
    Branch,
    Norm,
    Q,
    K,
    V,
    Attn,
    Gate,
    Up,
    Logits,
}

impl Buf {
    const COUNT: usize = 10;

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone)]
enum Node {
    Embed { table: WeightRef, kernel: CompiledKernel },
    RmsNorm { src: Buf, dst: Buf, weight: usize, kernel: CompiledKernel },
    Matmul { weight: WeightRef, src: Buf, dst: Buf, kernel: CompiledKernel },
    Rope { buf: Buf, kernel: CompiledKernel },
    KvStore { layer: usize },
    Attention { layer: usize, kernel: CompiledKernel },
    SiluMul { kernel: CompiledKernel },
    Residual { kernel: CompiledKernel },
    CheckFinite { layer: usize },
}

impl Node {
    fn op(&self) -> Option<OpKind> {
        match self {
            Self::Embed { kernel, .. }
            | Self::RmsNorm { kernel, .. }
            | Self::Matmul { kernel, .. }
            | Self::Rope { kernel, .. }
            | Self::Attention { kernel, .. }
            | Self::SiluMul { kernel }
            | Self::Residual { kernel } => Some(kernel.op),
            Self::KvStore { .. } | Self::CheckFinite { .. } => None,
        }
    }
}

/// All activation buffers in one arena-backed slab.
struct Activations {
    slab: HostBuffer<f32>,
    ranges: [Range<usize>; Buf::COUNT],
    /// Row decode scratch for F32/F16 matmuls.
    scratch: HostBuffer<f32>,
}

impl Activations {
    fn new(arena: &Arena, hp: &ModelHparams) -> Result<Self, EngineError> {
        let widths = [
            (Buf::Hidden, hp.hidden),
            (Buf::Branch, hp.hidden),
            (Buf::Norm, hp.hidden),
            (Buf::Q, hp.n_heads * hp.head_dim()),
            (Buf::K, hp.kv_dim()),
            (Buf::V, hp.kv_dim()),
            (Buf::Attn, hp.n_heads * hp.head_dim()),
            (Buf::Gate, hp.ffn_hidden),
            (Buf::Up, hp.ffn_hidden),
            (Buf::Logits, hp.vocab_size),
        ];
        let mut ranges: [Range<usize>; Buf::COUNT] = Default::default();
        let mut offset = 0;
        for (buf, width) in widths {
            ranges[buf.index()] = offset..offset + width;
            offset += width;
        }
        let slab = arena.alloc_host(offset, Owner::Activations)?;
        let scratch = arena.alloc_host(hp.hidden.max(hp.ffn_hidden), Owner::Activations)?;
        Ok(Self { slab, ranges, scratch })
    }

    fn get(&self, buf: Buf) -> &[f32] {
        &self.slab[self.ranges[buf.index()].clone()]
    }

    fn get_mut(&mut self, buf: Buf) -> &mut [f32] {
        let r = self.ranges[buf.index()].clone();
        &mut self.slab[r]
    }

    /// Read one buffer while writing another.
    fn split(&mut self, src: Buf, dst: Buf) -> (&[f32], &mut [f32]) {
        split_pair(&mut self.slab, &self.ranges[src.index()], &self.ranges[dst.index()])
    }

    fn bytes(&self) -> usize {
        (self.slab.len() + self.scratch.len()) * std::mem::size_of::<f32>()
    }
}

fn split_pair<'a>(slab: &'a mut [f32], src: &Range<usize>, dst: &Range<usize>) -> (&'a [f32], &'a mut [f32]) {
    debug_assert!(src.end <= dst.start || dst.end <= src.start);
    if src.start < dst.start {
        let (lo, hi) = slab.split_at_mut(dst.start);
        (&lo[src.clone()], &mut hi[..dst.len()])
    } else {
        let (lo, hi) = slab.split_at_mut(src.start);
        (&hi[..src.len()], &mut lo[dst.clone()])
    }
}

/// Planned forward pass over one loaded container.
pub struct ExecutionGraph {
    plan: Vec<Node>,
    /// First node of the final norm and LM head.
    head_start: usize,
    norms: Vec<HostBuffer<f32>>,
    acts: Activations,
    attn: FlashAttn,
    attn_scratch: AttnScratch,
    inv_freq: Vec<f32>,
    n_layers: usize,
    n_heads: usize,
    n_kv_heads: usize,
    head_dim: usize,
    rms_eps: f32,
    vocab_size: usize,
    profile: Option<Arc<KernelProfile>>,
}

struct Planner<'a> {
    container: &'a ModelContainer,
    kernels: &'a KernelSet,
    arena: &'a Arena,
    norms: Vec<HostBuffer<f32>>,
}

impl Planner<'_> {
    fn kernel(&self, op: OpKind) -> Result<CompiledKernel, EngineError> {
        Ok(self.kernels.get(op)?.clone())
    }

    fn matrix(&self, info: &TensorInfo, rows: usize, cols: usize) -> Result<WeightRef, EngineError> {
        if info.dims.len() != 2 || info.cols() != cols || info.rows() != rows {
            return Err(ContainerError::ShapeMismatch {
                tensor: info.name.clone(),
                expected: vec![cols as u64, rows as u64],
                actual: info.dims.clone(),
            }
            .into());
        }
        if info.ty.is_quantized() && cols % QK != 0 {
            return Err(ContainerError::Format(format!(
                "{}: row length {} is not a multiple of the {} block",
                info.name, cols, info.ty
            ))
            .into());
        }
        Ok(WeightRef {
            name: info.name.clone(),
            ty: info.ty,
            rows,
            cols,
            range: info.start as usize..info.end() as usize,
        })
    }

    fn matmul(&self, info: &TensorInfo, rows: usize, cols: usize, src: Buf, dst: Buf) -> Result<Node, EngineError> {
        let weight = self.matrix(info, rows, cols)?;
        let op = OpKind::matmul_for(weight.ty).ok_or_else(|| ContainerError::UnsupportedQuantization {
            tensor: weight.name.clone(),
            ty: weight.ty,
        })?;
        Ok(Node::Matmul {
            weight,
            src,
            dst,
            kernel: self.kernel(op)?,
        })
    }

    /// Decode a norm vector into an arena buffer and return its index.
    fn norm(&mut self, info: &TensorInfo, width: usize) -> Result<usize, EngineError> {
        if info.n_elements() != width as u64 {
            return Err(ContainerError::ShapeMismatch {
                tensor: info.name.clone(),
                expected: vec![width as u64],
                actual: info.dims.clone(),
            }
            .into());
        }
        let mut buf = self.arena.alloc_host::<f32>(width, Owner::Weights)?;
        quantize::dequantize_row(info.ty, self.container.tensor_bytes(info), &mut buf);
        self.norms.push(buf);
        Ok(self.norms.len() - 1)
    }

    fn rms_norm(&mut self, info: &TensorInfo, width: usize, src: Buf, dst: Buf) -> Result<Node, EngineError> {
        let weight = self.norm(info, width)?;
        Ok(Node::RmsNorm {
            src,
            dst,
            weight,
            kernel: self.kernel(OpKind::RmsNorm)?,
        })
    }
}

fn layer_tensor<'a>(file: &'a crate::models::GgufFile, role: LayerTensor, layer: usize) -> Result<&'a TensorInfo, EngineError> {
    role.find(file, layer)
        .ok_or_else(|| ContainerError::MissingTensor(role.primary_name(layer)).into())
}

impl ExecutionGraph {
    /// Plan the forward pass, resolving every tensor and kernel.
    pub fn build(
        container: &ModelContainer,
        kernels: &KernelSet,
        arena: &Arena,
        profile: Option<Arc<KernelProfile>>,
    ) -> Result<Self, EngineError> {
        let hp = container.hparams().clone();
        let file = container.gguf();
        let (hidden, hd, kv_dim, ffn, vocab) =
            (hp.hidden, hp.head_dim(), hp.kv_dim(), hp.ffn_hidden, hp.vocab_size);
        if hd % 2 != 0 {
            return Err(ContainerError::Format(format!("head dimension {} is odd", hd)).into());
        }

        let mut p = Planner {
            container,
            kernels,
            arena,
            norms: Vec::new(),
        };
        let mut plan = Vec::with_capacity(hp.n_layers * 17 + 4);

        let embd = find_token_embd(file).ok_or_else(|| ContainerError::MissingTensor(TOKEN_EMBD.into()))?;
        plan.push(Node::Embed {
            table: p.matrix(embd, vocab, hidden)?,
            kernel: p.kernel(OpKind::Embedding)?,
        });

        for layer in 0..hp.n_layers {
            let t = |role| layer_tensor(file, role, layer);
            plan.push(p.rms_norm(t(LayerTensor::AttnNorm)?, hidden, Buf::Hidden, Buf::Norm)?);
            plan.push(p.matmul(t(LayerTensor::AttnQ)?, hp.n_heads * hd, hidden, Buf::Norm, Buf::Q)?);
            plan.push(p.matmul(t(LayerTensor::AttnK)?, kv_dim, hidden, Buf::Norm, Buf::K)?);
            plan.push(p.matmul(t(LayerTensor::AttnV)?, kv_dim, hidden, Buf::Norm, Buf::V)?);
            let rope = p.kernel(OpKind::Rope)?;
            plan.push(Node::Rope { buf: Buf::Q, kernel: rope.clone() });
            plan.push(Node::Rope { buf: Buf::K, kernel: rope });
            plan.push(Node::KvStore { layer });
            plan.push(Node::Attention {
                layer,
                kernel: p.kernel(OpKind::Attention)?,
            });
            plan.push(p.matmul(t(LayerTensor::AttnOutput)?, hidden, hp.n_heads * hd, Buf::Attn, Buf::Branch)?);
            let residual = p.kernel(OpKind::ResidualAdd)?;
            plan.push(Node::Residual { kernel: residual.clone() });

            plan.push(p.rms_norm(t(LayerTensor::FfnNorm)?, hidden, Buf::Hidden, Buf::Norm)?);
            plan.push(p.matmul(t(LayerTensor::FfnGate)?, ffn, hidden, Buf::Norm, Buf::Gate)?);
            plan.push(p.matmul(t(LayerTensor::FfnUp)?, ffn, hidden, Buf::Norm, Buf::Up)?);
            plan.push(Node::SiluMul {
                kernel: p.kernel(OpKind::SiluMul)?,
            });
            plan.push(p.matmul(t(LayerTensor::FfnDown)?, hidden, ffn, Buf::Gate, Buf::Branch)?);
            plan.push(Node::Residual { kernel: residual });
            plan.push(Node::CheckFinite { layer });
        }

        let head_start = plan.len();
        let out_norm = find_output_norm(file)
            .ok_or_else(|| ContainerError::MissingTensor(crate::models::tensors::OUTPUT_NORM.into()))?;
        plan.push(p.rms_norm(out_norm, hidden, Buf::Hidden, Buf::Norm)?);
        // Tied embeddings when there is no separate LM head.
        let lm_head = find_output(file).unwrap_or(embd);
        plan.push(p.matmul(lm_head, vocab, hidden, Buf::Norm, Buf::Logits)?);
        plan.push(Node::CheckFinite { layer: hp.n_layers });

        // Sampling runs softmax on the host side of the graph.
        kernels.get(OpKind::Softmax)?;

        let attn_kernel = kernels.get(OpKind::Attention)?;
        let attn_config = FlashAttnConfig {
            block_size: attn_kernel.tile.max(1),
            head_dim: hd,
        };
        let attn_scratch = AttnScratch::new(&attn_config);
        let attn = FlashAttn::new(attn_config, attn_kernel.family());

        let acts = Activations::new(arena, &hp)?;
        let norms = p.norms;

        tracing::debug!(
            nodes = plan.len(),
            layers = hp.n_layers,
            activation_bytes = acts.bytes(),
            "Execution graph planned"
        );

        Ok(Self {
            plan,
            head_start,
            norms,
            acts,
            attn,
            attn_scratch,
            inv_freq: cpu::rope_inv_freq(hd, hp.rope_base),
            n_layers: hp.n_layers,
            n_heads: hp.n_heads,
            n_kv_heads: hp.n_kv_heads,
            head_dim: hd,
            rms_eps: hp.rms_eps,
            vocab_size: vocab,
            profile,
        })
    }

    /// Run one position. Stores its key/value in `cache` and, when
    /// `want_logits`, returns the next-token logits.
    pub fn forward(
        &mut self,
        weights: &[u8],
        token: u32,
        pos: usize,
        cache: &mut KvCache,
        want_logits: bool,
    ) -> Result<Option<&[f32]>, EngineError> {
        if token as usize >= self.vocab_size {
            return Err(EngineError::InvalidInput(format!(
                "token {} outside vocabulary of {}",
                token, self.vocab_size
            )));
        }
        let Self {
            plan,
            head_start,
            norms,
            acts,
            attn,
            attn_scratch,
            inv_freq,
            n_layers,
            n_heads,
            n_kv_heads,
            head_dim,
            rms_eps,
            profile,
            ..
        } = self;
        let (n_heads, hd) = (*n_heads, *head_dim);
        let group = n_heads / *n_kv_heads;
        let end = if want_logits { plan.len() } else { *head_start };

        for (i, node) in plan[..end].iter().enumerate() {
            if i == *head_start {
                cache.advance()?;
            }
            let _timer = profile.as_ref().zip(node.op()).map(|(p, op)| p.time(op));
            match node {
                Node::Embed { table, .. } => {
                    cpu::embedding(table.ty, table.bytes(weights), token as usize, acts.get_mut(Buf::Hidden));
                }
                Node::RmsNorm { src, dst, weight, kernel } => {
                    let (x, out) = acts.split(*src, *dst);
                    cpu::rmsnorm(kernel.family(), x, &norms[*weight], *rms_eps, out);
                }
                Node::Matmul { weight, src, dst, kernel } => {
                    let Activations { slab, ranges, scratch } = acts;
                    let (x, out) = split_pair(slab, &ranges[src.index()], &ranges[dst.index()]);
                    cpu::matvec(
                        kernel.family(),
                        kernel.tile,
                        weight.ty,
                        weight.bytes(weights),
                        x,
                        out,
                        scratch,
                    );
                }
                Node::Rope { buf, .. } => {
                    cpu::rope(acts.get_mut(*buf), hd, pos, inv_freq);
                }
                Node::KvStore { layer } => {
                    cache.store(*layer, pos, acts.get(Buf::K), acts.get(Buf::V))?;
                }
                Node::Attention { layer, .. } => {
                    let (q, out) = acts.split(Buf::Q, Buf::Attn);
                    for h in 0..n_heads {
                        let heads = h * hd..(h + 1) * hd;
                        let (qh, oh) = (&q[heads.clone()], &mut out[heads]);
                        match cache.view(*layer, h / group, pos + 1) {
                            KvView::F32 { keys, values } => {
                                cpu::attention(attn, qh, keys, values, oh, attn_scratch)
                            }
                            KvView::F16 { keys, values } => {
                                cpu::attention(attn, qh, keys, values, oh, attn_scratch)
                            }
                        }
                    }
                }
                Node::SiluMul { .. } => {
                    let (up, gate) = acts.split(Buf::Up, Buf::Gate);
                    cpu::silu_mul(gate, up);
                }
                Node::Residual { .. } => {
                    let (branch, hidden) = acts.split(Buf::Branch, Buf::Hidden);
                    cpu::residual_add(hidden, branch);
                }
                Node::CheckFinite { layer } => {
                    let buf = if *layer == *n_layers {
                        Buf::Logits
                    } else {
                        Buf::Hidden
                    };
                    if !acts.get(buf).iter().all(|v| v.is_finite()) {
                        return Err(EngineError::NumericInstability { layer: *layer });
                    }
                }
            }
        }

        if !want_logits {
            cache.advance()?;
            return Ok(None);
        }
        Ok(Some(acts.get(Buf::Logits)))
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn node_count(&self) -> usize {
        self.plan.len()
    }

    /// Bytes of activation buffers owned by the graph.
    pub fn activation_bytes(&self) -> usize {
        self.acts.bytes()
    }

    pub fn profile(&self) -> Option<&Arc<KernelProfile>> {
        self.profile.as_ref()
    }
}

impl std::fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("nodes", &self.plan.len())
            .field("heads", &self.n_heads)
            .field("kv_heads", &self.n_kv_heads)
            .field("head_dim", &self.head_dim)
            .finish()
    }
}
