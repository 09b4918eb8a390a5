use std::ops::Range;

/// Per-node core geometry snapshot the selector works against.
///
/// Core indices are global: node `n` owns the half-open range
/// `core_offset[n] .. core_offset[n] + sockets[n] * cores_per_socket[n]`.
#[derive(Debug, Clone, Default)]
pub struct NodeLayout {
    pub sockets: Vec<u32>,
    pub cores_per_socket: Vec<u32>,
    pub threads_per_core: Vec<u32>,
    pub real_memory: Vec<u64>,
    pub core_offset: Vec<usize>,
    pub total_cores: usize,
}

impl NodeLayout {
    pub fn build(
        geometry: impl IntoIterator<Item = (u32, u32, u32, u64)>,
    ) -> NodeLayout {
        let mut layout = NodeLayout::default();
        for (sockets, cores_per_socket, threads_per_core, real_memory) in geometry {
            layout.core_offset.push(layout.total_cores);
            layout.total_cores += (sockets * cores_per_socket) as usize;
            layout.sockets.push(sockets);
            layout.cores_per_socket.push(cores_per_socket);
            layout.threads_per_core.push(threads_per_core);
            layout.real_memory.push(real_memory);
        }
        layout
    }

    /// Uniform cluster helper used by tests.
    pub fn uniform(nodes: usize, sockets: u32, cores_per_socket: u32, threads: u32) -> NodeLayout {
        Self::build((0..nodes).map(|_| (sockets, cores_per_socket, threads, 1024)))
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.sockets.len()
    }

    #[inline]
    pub fn cores_on(&self, node: usize) -> usize {
        (self.sockets[node] * self.cores_per_socket[node]) as usize
    }

    #[inline]
    pub fn core_range(&self, node: usize) -> Range<usize> {
        let start = self.core_offset[node];
        start..start + self.cores_on(node)
    }

    #[inline]
    pub fn cpus_on(&self, node: usize) -> u32 {
        self.sockets[node] * self.cores_per_socket[node] * self.threads_per_core[node]
    }
}
