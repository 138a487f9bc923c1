use crate::packet::TcpFlags;
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddrV4},
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifies one TCP flow crossing the tun device, as seen from the client side.
#[derive(Hash, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct FlowKey {
    pub src_addr: u32,
    pub src_port: u16,
    pub dst_addr: u32,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self {
            src_addr: u32::from(*src.ip()),
            src_port: src.port(),
            dst_addr: u32::from(*dst.ip()),
            dst_port: dst.port(),
        }
    }

    pub fn src(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.src_addr), self.src_port)
    }

    pub fn dst(&self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.dst_addr), self.dst_port)
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src(), self.dst())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlowState {
    /// Upstream connect in progress, no SYN-ACK sent yet.
    Opening,
    Established,
}

/// A client segment handed from the device read loop to the flow's task.
#[derive(Clone, Debug)]
pub struct InboundSegment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

static FLOW_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

#[derive(Clone, Debug)]
pub struct Flow {
    id: u64,
    state: FlowState,
    sender: mpsc::Sender<InboundSegment>,
    cancel: CancellationToken,
}

impl Flow {
    pub fn new(sender: mpsc::Sender<InboundSegment>, cancel: CancellationToken) -> Self {
        let id = FLOW_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            id,
            state: FlowState::Opening,
            sender,
            cancel,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn sender(&self) -> &mpsc::Sender<InboundSegment> {
        &self.sender
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowTableError {
    #[error("flow {0} already exists")]
    Exists(FlowKey),
    #[error("flow table is full ({0} flows)")]
    Full(usize),
}

/// Live flows by key. At most one flow exists per key.
///
/// Removing a flow cancels its token, which tears down the tasks owning the forwarding socket.
#[derive(Debug)]
pub struct FlowTable {
    flows: Mutex<HashMap<FlowKey, Flow>>,
    max_flows: usize,
}

impl FlowTable {
    pub fn new(max_flows: usize) -> Self {
        Self {
            flows: Mutex::new(HashMap::new()),
            max_flows,
        }
    }

    fn flows(&self) -> MutexGuard<'_, HashMap<FlowKey, Flow>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<Flow> {
        self.flows().get(key).cloned()
    }

    pub fn insert(&self, key: FlowKey, flow: Flow) -> Result<(), FlowTableError> {
        let mut flows = self.flows();
        if flows.contains_key(&key) {
            return Err(FlowTableError::Exists(key));
        }
        if flows.len() >= self.max_flows {
            return Err(FlowTableError::Full(flows.len()));
        }
        flows.insert(key, flow);
        Ok(())
    }

    /// Updates the state of the flow with generation `id`; false if it is gone.
    pub fn set_state(&self, key: &FlowKey, id: u64, state: FlowState) -> bool {
        match self.flows().get_mut(key) {
            Some(flow) if flow.id == id => {
                flow.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Flow> {
        let flow = self.flows().remove(key)?;
        flow.cancel.cancel();
        Some(flow)
    }

    /// Removes the flow only if it is still generation `id`.
    pub fn remove_generation(&self, key: &FlowKey, id: u64) -> Option<Flow> {
        let flow = {
            let mut flows = self.flows();
            if !flows.get(key).is_some_and(|flow| flow.id == id) {
                return None;
            }
            flows.remove(key)
        }?;
        flow.cancel.cancel();
        Some(flow)
    }

    pub fn len(&self) -> usize {
        self.flows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows().is_empty()
    }

    pub fn keys(&self) -> Vec<FlowKey> {
        self.flows().keys().copied().collect()
    }

    /// Removes and cancels every flow.
    pub fn clear(&self) {
        let flows: Vec<Flow> = self.flows().drain().map(|(_, flow)| flow).collect();
        for flow in flows {
            flow.cancel.cancel();
        }
    }
}
