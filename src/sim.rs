//! Software model of an AXI DMA engine and of CMA memory.
//!
//! Lets the whole stack run on a host without programmable logic. The
//! engine can be told how each channel behaves (complete at once, after a
//! delay, never, or with an error; reject configuration, preparation or
//! submission) and records what it was asked to do. With
//! [`SimEngine::loopback`] the engine also moves data: everything written
//! on a transmit channel is queued and handed back on the next receive.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::debug;

use crate::buffer::{CoherentAllocator, CoherentRegion};
use crate::engine::{
    Callback, ChannelDescriptor, ChannelType, Cookie, Direction, DmaChannel, DmaEngine, DmaStatus,
    PrepFlags, SgEntry, SlaveConfig, TransferDirection, TxDescriptor,
};
use crate::{EngineError, Error};

const BUS_BASE: u64 = 0x3000_0000;
const PAGE_SIZE: u64 = 4096;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Heap-backed stand-in for `dma_alloc_coherent` + `mmap`.
///
/// User and kernel addresses are the same heap pointer; bus addresses are
/// synthetic, page aligned and never reused.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

#[derive(Debug, Default)]
struct HeapState {
    next_bus: u64,
    // bus address -> (kernel address, size)
    live: BTreeMap<u64, (usize, usize)>,
    limit: Option<usize>,
}

impl HeapState {
    fn live_bytes(&self) -> usize {
        self.live.values().map(|(_, size)| size).sum()
    }
}

impl HeapAllocator {
    pub fn new() -> HeapAllocator {
        HeapAllocator::default()
    }

    /// Caps the total number of live bytes.
    pub fn with_limit(limit: usize) -> HeapAllocator {
        let allocator = HeapAllocator::default();
        lock(&allocator.state).limit = Some(limit);
        allocator
    }

    pub fn live(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn live_bytes(&self) -> usize {
        lock(&self.state).live_bytes()
    }

    /// Kernel address of `[bus, bus + len)`, if it lies in one allocation.
    fn resolve(&self, bus: u64, len: usize) -> Option<usize> {
        let state = lock(&self.state);
        let (&start, &(kern, size)) = state.live.range(..=bus).next_back()?;
        let offset = (bus - start) as usize;
        if offset.checked_add(len)? <= size {
            Some(kern + offset)
        } else {
            None
        }
    }
}

impl CoherentAllocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Result<CoherentRegion, Error> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut state = lock(&self.state);
        if let Some(limit) = state.limit {
            let total = state.live_bytes().checked_add(size);
            if total.map_or(true, |total| total > limit) {
                return Err(Error::OutOfMemory);
            }
        }
        let mut memory = Vec::new();
        memory
            .try_reserve_exact(size)
            .map_err(|_| Error::OutOfMemory)?;
        memory.resize(size, 0u8);
        let memory = memory.into_boxed_slice();
        let addr = Box::into_raw(memory) as *mut u8 as usize;
        let bus_addr = BUS_BASE + state.next_bus;
        state.next_bus += (size as u64).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        state.live.insert(bus_addr, (addr, size));
        Ok(CoherentRegion {
            user_addr: addr,
            kern_addr: addr,
            bus_addr,
            size,
        })
    }

    fn free(&self, region: &CoherentRegion) {
        let mut state = lock(&self.state);
        if state.live.remove(&region.bus_addr).is_some() {
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    region.kern_addr as *mut u8,
                    region.size,
                )));
            }
        }
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, (kern, size)) in std::mem::take(&mut state.live) {
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    kern as *mut u8,
                    size,
                )));
            }
        }
    }
}

/// How a channel finishes the transactions it is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Immediate,
    Delayed(Duration),
    /// Hangs until terminated or [`SimChannel::complete_all`].
    Never,
    /// Runs the callback but reports [`DmaStatus::Error`].
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigResponse {
    Accept,
    NotSupported,
    Reject(i32),
}

#[derive(Debug, Clone, Copy)]
struct Behavior {
    completion: CompletionMode,
    config: ConfigResponse,
    prep_fails: bool,
    submit_fails: bool,
}

struct Queued {
    cookie: i32,
    sg: Vec<SgEntry>,
    direction: TransferDirection,
    callback: Option<Callback>,
}

#[derive(Default)]
struct ModelState {
    next_cookie: i32,
    pending: Vec<Queued>,
    running: Vec<Queued>,
    status: HashMap<i32, DmaStatus>,
    configs: Vec<SlaveConfig>,
    last_sg: Option<Vec<SgEntry>>,
    last_flags: Option<PrepFlags>,
    submitted: usize,
    issued: usize,
    terminations: usize,
}

struct Loopback {
    memory: Arc<HeapAllocator>,
    fifo: Mutex<VecDeque<u8>>,
}

impl Loopback {
    fn transfer(&self, queued: &Queued) {
        for entry in &queued.sg {
            let kern = match self.memory.resolve(entry.bus_addr, entry.len) {
                Some(kern) => kern as *mut u8,
                None => continue,
            };
            let mut fifo = lock(&self.fifo);
            match queued.direction {
                TransferDirection::MemToDev => {
                    let data = unsafe { std::slice::from_raw_parts(kern, entry.len) };
                    fifo.extend(data.iter().copied());
                }
                TransferDirection::DevToMem => {
                    let n = entry.len.min(fifo.len());
                    let data = unsafe { std::slice::from_raw_parts_mut(kern, n) };
                    for (dst, src) in data.iter_mut().zip(fifo.drain(..n)) {
                        *dst = src;
                    }
                }
            }
        }
    }
}

struct ChannelModel {
    desc: ChannelDescriptor,
    behavior: Mutex<Behavior>,
    state: Mutex<ModelState>,
    loopback: Option<Arc<Loopback>>,
}

impl ChannelModel {
    /// Marks `cookie` complete and hands back its callback, unless it was
    /// terminated in the meantime.
    fn retire(&self, cookie: i32, status: DmaStatus) -> Option<Queued> {
        let mut state = lock(&self.state);
        let index = state.running.iter().position(|q| q.cookie == cookie)?;
        let queued = state.running.swap_remove(index);
        state.status.insert(cookie, status);
        Some(queued)
    }

    fn finish(&self, mut queued: Queued, status: DmaStatus) {
        if status == DmaStatus::Complete {
            if let Some(loopback) = &self.loopback {
                loopback.transfer(&queued);
            }
        }
        if let Some(callback) = queued.callback.take() {
            callback();
        }
    }
}

/// One simulated channel. Clones share the same model.
#[derive(Clone)]
pub struct SimChannel {
    model: Arc<ChannelModel>,
}

impl fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimChannel ({})", &self.model.desc.name)
    }
}

impl SimChannel {
    fn new(desc: ChannelDescriptor, loopback: Option<Arc<Loopback>>) -> SimChannel {
        SimChannel {
            model: Arc::new(ChannelModel {
                desc,
                behavior: Mutex::new(Behavior {
                    completion: CompletionMode::Immediate,
                    config: ConfigResponse::Accept,
                    prep_fails: false,
                    submit_fails: false,
                }),
                state: Mutex::new(ModelState::default()),
                loopback,
            }),
        }
    }

    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.model.desc
    }

    pub fn set_completion(&self, mode: CompletionMode) {
        lock(&self.model.behavior).completion = mode;
    }

    pub fn set_config_response(&self, response: ConfigResponse) {
        lock(&self.model.behavior).config = response;
    }

    pub fn set_prep_fails(&self, fails: bool) {
        lock(&self.model.behavior).prep_fails = fails;
    }

    pub fn set_submit_fails(&self, fails: bool) {
        lock(&self.model.behavior).submit_fails = fails;
    }

    pub fn configs(&self) -> Vec<SlaveConfig> {
        lock(&self.model.state).configs.clone()
    }

    pub fn last_sg(&self) -> Option<Vec<SgEntry>> {
        lock(&self.model.state).last_sg.clone()
    }

    pub fn last_flags(&self) -> Option<PrepFlags> {
        lock(&self.model.state).last_flags
    }

    pub fn submitted(&self) -> usize {
        lock(&self.model.state).submitted
    }

    pub fn issued(&self) -> usize {
        lock(&self.model.state).issued
    }

    pub fn terminations(&self) -> usize {
        lock(&self.model.state).terminations
    }

    /// Transactions submitted or running and not yet retired.
    pub fn in_flight(&self) -> usize {
        let state = lock(&self.model.state);
        state.pending.len() + state.running.len()
    }

    /// Completes every running transaction now.
    pub fn complete_all(&self) {
        let cookies: Vec<i32> = lock(&self.model.state)
            .running
            .iter()
            .map(|q| q.cookie)
            .collect();
        for cookie in cookies {
            if let Some(queued) = self.model.retire(cookie, DmaStatus::Complete) {
                self.model.finish(queued, DmaStatus::Complete);
            }
        }
    }
}

impl DmaChannel for SimChannel {
    fn slave_config(&self, config: &SlaveConfig) -> Result<(), EngineError> {
        lock(&self.model.state).configs.push(*config);
        match lock(&self.model.behavior).config {
            ConfigResponse::Accept => Ok(()),
            ConfigResponse::NotSupported => Err(EngineError::NotSupported),
            ConfigResponse::Reject(errno) => Err(EngineError::Rejected(errno)),
        }
    }

    fn prep_slave_sg(
        &self,
        sg: &[SgEntry],
        direction: TransferDirection,
        flags: PrepFlags,
    ) -> Option<TxDescriptor> {
        if lock(&self.model.behavior).prep_fails {
            return None;
        }
        let mut state = lock(&self.model.state);
        state.last_sg = Some(sg.to_vec());
        state.last_flags = Some(flags);
        Some(TxDescriptor::new(sg, direction, flags))
    }

    fn submit(&self, tx: TxDescriptor) -> Result<Cookie, EngineError> {
        if lock(&self.model.behavior).submit_fails {
            return Err(EngineError::Busy);
        }
        let mut state = lock(&self.model.state);
        state.next_cookie += 1;
        let cookie = state.next_cookie;
        state.status.insert(cookie, DmaStatus::InProgress);
        state.pending.push(Queued {
            cookie,
            sg: tx.sg,
            direction: tx.direction,
            callback: tx.callback,
        });
        state.submitted += 1;
        Ok(Cookie(cookie))
    }

    fn issue_pending(&self) {
        let mode = lock(&self.model.behavior).completion;
        let cookies: Vec<i32> = {
            let mut state = lock(&self.model.state);
            state.issued += 1;
            let pending = std::mem::take(&mut state.pending);
            let cookies = pending.iter().map(|q| q.cookie).collect();
            state.running.extend(pending);
            cookies
        };

        for cookie in cookies {
            match mode {
                CompletionMode::Immediate | CompletionMode::Fail => {
                    let status = if mode == CompletionMode::Fail {
                        DmaStatus::Error
                    } else {
                        DmaStatus::Complete
                    };
                    if let Some(queued) = self.model.retire(cookie, status) {
                        self.model.finish(queued, status);
                    }
                }
                CompletionMode::Delayed(delay) => {
                    let model = self.model.clone();
                    thread::spawn(move || {
                        thread::sleep(delay);
                        if let Some(queued) = model.retire(cookie, DmaStatus::Complete) {
                            model.finish(queued, DmaStatus::Complete);
                        }
                    });
                }
                CompletionMode::Never => {}
            }
        }
    }

    fn tx_status(&self, cookie: Cookie) -> DmaStatus {
        lock(&self.model.state)
            .status
            .get(&cookie.0)
            .copied()
            .unwrap_or(DmaStatus::Error)
    }

    fn terminate_all(&self) -> Result<(), EngineError> {
        let dropped = {
            let mut state = lock(&self.model.state);
            state.terminations += 1;
            let mut dropped = std::mem::take(&mut state.pending);
            dropped.append(&mut state.running);
            for q in &dropped {
                state.status.insert(q.cookie, DmaStatus::Error);
            }
            dropped
        };
        debug!(
            "{}: terminated {} transactions",
            self.model.desc.name,
            dropped.len()
        );
        Ok(())
    }
}

struct EngineModel {
    channels: Vec<SimChannel>,
    reserved: Mutex<HashSet<usize>>,
    failing: Mutex<HashSet<(i32, ChannelType, Direction)>>,
}

/// A simulated engine exposing a fixed set of channels. Clones share state.
#[derive(Clone)]
pub struct SimEngine {
    model: Arc<EngineModel>,
}

impl fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEngine")
            .field("channels", &self.model.channels)
            .finish()
    }
}

impl SimEngine {
    pub fn new(descriptors: Vec<ChannelDescriptor>) -> SimEngine {
        SimEngine::build(descriptors, None)
    }

    /// An engine that loops transmitted data back to the receive channels.
    pub fn loopback(descriptors: Vec<ChannelDescriptor>, memory: Arc<HeapAllocator>) -> SimEngine {
        let loopback = Arc::new(Loopback {
            memory,
            fifo: Mutex::new(VecDeque::new()),
        });
        SimEngine::build(descriptors, Some(loopback))
    }

    fn build(descriptors: Vec<ChannelDescriptor>, loopback: Option<Arc<Loopback>>) -> SimEngine {
        let channels = descriptors
            .into_iter()
            .map(|d| SimChannel::new(d, loopback.clone()))
            .collect();
        SimEngine {
            model: Arc::new(EngineModel {
                channels,
                reserved: Mutex::new(HashSet::new()),
                failing: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// The first channel matching the triple.
    pub fn channel(&self, id: i32, ty: ChannelType, dir: Direction) -> Option<SimChannel> {
        self.model
            .channels
            .iter()
            .find(|c| {
                let d = c.descriptor();
                d.id == id && d.ty == ty && d.dir == dir
            })
            .cloned()
    }

    /// Makes the next requests for this channel fail.
    pub fn fail_request(&self, id: i32, ty: ChannelType, dir: Direction) {
        lock(&self.model.failing).insert((id, ty, dir));
    }

    /// Number of channels currently reserved.
    pub fn reserved(&self) -> usize {
        lock(&self.model.reserved).len()
    }
}

impl DmaEngine for SimEngine {
    type Channel = SimChannel;

    fn enumerate(&self) -> Vec<ChannelDescriptor> {
        self.model
            .channels
            .iter()
            .map(|c| c.descriptor().clone())
            .collect()
    }

    fn request_channel(&self, desc: &ChannelDescriptor) -> Result<SimChannel, EngineError> {
        if lock(&self.model.failing).contains(&(desc.id, desc.ty, desc.dir)) {
            return Err(EngineError::Rejected(libc::ENODEV));
        }
        let mut reserved = lock(&self.model.reserved);
        let index = self
            .model
            .channels
            .iter()
            .enumerate()
            .position(|(i, c)| c.descriptor() == desc && !reserved.contains(&i))
            .ok_or(EngineError::Busy)?;
        reserved.insert(index);
        Ok(self.model.channels[index].clone())
    }

    fn release_channel(&self, chan: SimChannel) {
        if let Some(index) = self
            .model
            .channels
            .iter()
            .position(|c| Arc::ptr_eq(&c.model, &chan.model))
        {
            lock(&self.model.reserved).remove(&index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_rx() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new(0, ChannelType::Dma, Direction::Write, "tx"),
            ChannelDescriptor::new(1, ChannelType::Dma, Direction::Read, "rx"),
        ]
    }

    #[test]
    fn heap_allocator_hands_out_disjoint_bus_ranges() {
        let heap = HeapAllocator::new();
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(5000).unwrap();
        assert_eq!(a.bus_addr % PAGE_SIZE, 0);
        assert!(b.bus_addr >= a.bus_addr + 100);
        assert_eq!(heap.resolve(a.bus_addr + 10, 90), Some(a.kern_addr + 10));
        assert_eq!(heap.resolve(a.bus_addr + 10, 91), None);
        heap.free(&a);
        assert_eq!(heap.live(), 1);
        assert_eq!(heap.live_bytes(), 5000);
    }

    #[test]
    fn heap_allocator_limit() {
        let heap = HeapAllocator::with_limit(4096);
        let a = heap.alloc(4000).unwrap();
        assert!(matches!(heap.alloc(200), Err(Error::OutOfMemory)));
        heap.free(&a);
        assert!(heap.alloc(200).is_ok());
    }

    #[test]
    fn heap_allocator_refuses_impossible_sizes() {
        let heap = HeapAllocator::new();
        assert!(matches!(heap.alloc(usize::MAX), Err(Error::OutOfMemory)));
        let limited = HeapAllocator::with_limit(4096);
        let _a = limited.alloc(100).unwrap();
        assert!(matches!(limited.alloc(usize::MAX), Err(Error::OutOfMemory)));
        assert_eq!(heap.live(), 0);
        assert_eq!(limited.live(), 1);
    }

    #[test]
    fn channels_are_exclusive() {
        let engine = SimEngine::new(tx_rx());
        let desc = engine.enumerate()[0].clone();
        let chan = engine.request_channel(&desc).unwrap();
        assert!(matches!(
            engine.request_channel(&desc),
            Err(EngineError::Busy)
        ));
        engine.release_channel(chan);
        assert_eq!(engine.reserved(), 0);
        assert!(engine.request_channel(&desc).is_ok());
    }

    #[test]
    fn terminate_turns_in_flight_cookies_into_errors() {
        let engine = SimEngine::new(tx_rx());
        let chan = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        chan.set_completion(CompletionMode::Never);
        let sg = [SgEntry {
            bus_addr: BUS_BASE,
            len: 16,
        }];
        let tx = chan
            .prep_slave_sg(&sg, TransferDirection::MemToDev, PrepFlags::INTERRUPT)
            .unwrap();
        let cookie = chan.submit(tx).unwrap();
        chan.issue_pending();
        assert_eq!(chan.tx_status(cookie), DmaStatus::InProgress);
        chan.terminate_all().unwrap();
        assert_eq!(chan.tx_status(cookie), DmaStatus::Error);
        assert_eq!(chan.in_flight(), 0);
    }

    #[test]
    fn loopback_moves_data_from_tx_to_rx() {
        let heap = Arc::new(HeapAllocator::new());
        let engine = SimEngine::loopback(tx_rx(), heap.clone());
        let src = heap.alloc(64).unwrap();
        let dst = heap.alloc(64).unwrap();
        unsafe {
            for i in 0..64 {
                *(src.kern_addr as *mut u8).add(i) = i as u8;
            }
        }

        let tx = engine.channel(0, ChannelType::Dma, Direction::Write).unwrap();
        let rx = engine.channel(1, ChannelType::Dma, Direction::Read).unwrap();
        let desc = tx
            .prep_slave_sg(
                &[SgEntry {
                    bus_addr: src.bus_addr,
                    len: 64,
                }],
                TransferDirection::MemToDev,
                PrepFlags::INTERRUPT,
            )
            .unwrap();
        tx.submit(desc).unwrap();
        tx.issue_pending();
        let desc = rx
            .prep_slave_sg(
                &[SgEntry {
                    bus_addr: dst.bus_addr,
                    len: 64,
                }],
                TransferDirection::DevToMem,
                PrepFlags::INTERRUPT,
            )
            .unwrap();
        rx.submit(desc).unwrap();
        rx.issue_pending();

        let out = unsafe { std::slice::from_raw_parts(dst.kern_addr as *const u8, 64) };
        assert!(out.iter().enumerate().all(|(i, &b)| b == i as u8));
    }
}
