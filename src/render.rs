//! The interface the core exposes to a renderer.
//!
//! The core never touches GPU resources; it produces mesh payloads and
//! transform updates, and the renderer drains them from a message queue.
//! Proxy handles are plain `Arc`s: the owning chunk (or animation) holds one
//! strong reference and every queued message holds another, so a frame in
//! flight keeps drawing a proxy that the world has already dropped.

use crate::{
    aabb::{Aabb, Sphere},
    mesher::{MesherOutput, PointLight},
    util::ChannelPair,
    world::{block::BlockValue, ChunkPos},
};
use nalgebra::Matrix4;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

fn next_proxy_id() -> u64 {
    NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed)
}

/// Render-side handle for one chunk's terrain mesh.
#[derive(Debug)]
pub struct ChunkRenderProxy {
    id: u64,
    chunk: ChunkPos,
    mesh: Mutex<Option<Arc<MesherOutput>>>,
    visible: AtomicBool,
}

impl ChunkRenderProxy {
    pub fn new(chunk: ChunkPos) -> Arc<Self> {
        Arc::new(Self {
            id: next_proxy_id(),
            chunk,
            mesh: Mutex::new(None),
            visible: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn chunk(&self) -> ChunkPos {
        self.chunk
    }

    pub fn mesh(&self) -> Option<Arc<MesherOutput>> {
        self.mesh.lock().clone()
    }

    pub fn swap_mesh(&self, mesh: Arc<MesherOutput>) {
        *self.mesh.lock() = Some(mesh);
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }

    pub fn bounds(&self) -> Option<Aabb> {
        self.mesh.lock().as_ref().map(|mesh| mesh.bounds)
    }
}

/// Render-side handle for one animated block.
pub struct BlockRenderProxy {
    id: u64,
    value: BlockValue,
    tint: u32,
    mesh: Arc<MesherOutput>,
    transform: Mutex<Matrix4<f32>>,
    visible: AtomicBool,
}

impl BlockRenderProxy {
    pub fn new(value: BlockValue, tint: u32, mesh: Arc<MesherOutput>) -> Arc<Self> {
        Arc::new(Self {
            id: next_proxy_id(),
            value,
            tint,
            mesh,
            transform: Mutex::new(Matrix4::identity()),
            visible: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn value(&self) -> BlockValue {
        self.value
    }

    pub fn tint(&self) -> u32 {
        self.tint
    }

    pub fn mesh(&self) -> &Arc<MesherOutput> {
        &self.mesh
    }

    pub fn set_transform(&self, transform: Matrix4<f32>) {
        *self.transform.lock() = transform;
    }

    pub fn transform(&self) -> Matrix4<f32> {
        *self.transform.lock()
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::Relaxed);
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Relaxed)
    }
}

/// One draw call's worth of state, resolved from a proxy during `draw`.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawBatch {
    pub material_index: u32,
    pub first_index: u32,
    pub index_count: u32,
    pub transform: Matrix4<f32>,
}

/// A prepared entry for a frame: bounds for culling plus a sort key.
#[derive(Clone, Debug)]
pub struct PreparedDraw {
    pub proxy_id: u64,
    pub bounds: Aabb,
    pub sphere: Sphere,
}

/// The closed set of things the renderer can draw. Both variants answer the
/// same three calls: `enqueue` submits the proxy into a frame, `prepare`
/// resolves culling data, `draw` flattens into material batches.
#[derive(Clone)]
pub enum RenderProxy {
    Chunk(Arc<ChunkRenderProxy>),
    Block(Arc<BlockRenderProxy>),
}

impl RenderProxy {
    pub fn id(&self) -> u64 {
        match self {
            RenderProxy::Chunk(proxy) => proxy.id(),
            RenderProxy::Block(proxy) => proxy.id(),
        }
    }

    pub fn enqueue(&self, frame: &mut FrameQueue) {
        if let Some(prepared) = self.prepare() {
            frame.entries.push((self.clone(), prepared));
        }
    }

    pub fn prepare(&self) -> Option<PreparedDraw> {
        match self {
            RenderProxy::Chunk(proxy) => {
                if !proxy.is_visible() {
                    return None;
                }
                let mesh = proxy.mesh()?;
                Some(PreparedDraw {
                    proxy_id: proxy.id(),
                    bounds: mesh.bounds,
                    sphere: mesh.sphere,
                })
            }
            RenderProxy::Block(proxy) => {
                if !proxy.is_visible() {
                    return None;
                }
                Some(PreparedDraw {
                    proxy_id: proxy.id(),
                    bounds: proxy.mesh().bounds,
                    sphere: proxy.mesh().sphere,
                })
            }
        }
    }

    pub fn draw(&self, out: &mut Vec<DrawBatch>) {
        let (mesh, transform) = match self {
            RenderProxy::Chunk(proxy) => match proxy.mesh() {
                Some(mesh) => (mesh, Matrix4::identity()),
                None => return,
            },
            RenderProxy::Block(proxy) => (Arc::clone(proxy.mesh()), proxy.transform()),
        };
        for batch in &mesh.batches {
            out.push(DrawBatch {
                material_index: batch.material_index,
                first_index: batch.start_index,
                index_count: batch.index_count,
                transform,
            });
        }
    }
}

/// One frame's worth of enqueued proxies, drained by the renderer.
#[derive(Default)]
pub struct FrameQueue {
    entries: Vec<(RenderProxy, PreparedDraw)>,
}

impl FrameQueue {
    pub fn entries(&self) -> &[(RenderProxy, PreparedDraw)] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Ordered messages from the world to the renderer. Each message that
/// references a proxy carries a strong handle.
pub enum RenderMessage {
    AddChunkProxy {
        proxy: Arc<ChunkRenderProxy>,
    },
    UpdateChunkMesh {
        proxy: Arc<ChunkRenderProxy>,
        mesh: Arc<MesherOutput>,
    },
    RemoveChunkProxy {
        proxy: Arc<ChunkRenderProxy>,
    },
    AddBlockProxy {
        proxy: Arc<BlockRenderProxy>,
    },
    UpdateBlockTransform {
        proxy: Arc<BlockRenderProxy>,
        transform: Matrix4<f32>,
    },
    RemoveBlockProxy {
        proxy: Arc<BlockRenderProxy>,
    },
    PointLights {
        chunk: ChunkPos,
        lights: Vec<PointLight>,
    },
}

/// World-side sender half of the renderer queue.
#[derive(Clone)]
pub struct RendererHandle {
    tx: crossbeam_channel::Sender<RenderMessage>,
}

impl RendererHandle {
    pub fn send(&self, message: RenderMessage) {
        // a detached renderer is not an error; the world keeps simulating
        let _ = self.tx.send(message);
    }
}

/// Renderer-side receiving half.
pub struct RenderSink {
    rx: crossbeam_channel::Receiver<RenderMessage>,
}

impl RenderSink {
    pub fn drain(&self) -> Vec<RenderMessage> {
        self.rx.try_iter().collect()
    }
}

pub fn render_queue() -> (RendererHandle, RenderSink) {
    let pair = ChannelPair::new();
    (RendererHandle { tx: pair.tx }, RenderSink { rx: pair.rx })
}
