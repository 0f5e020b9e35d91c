//! Transfer descriptors and the descriptor arena
//!
//! A descriptor is one packet-level protocol step of a transfer. Descriptors
//! live in a fixed arena and are addressed by [`TdHandle`]; a transfer's chain
//! is the ordered list of handles it was given when it was built.

use bitflags::bitflags;

use crate::error::{Result, UsbError};
use crate::otg::{HcChar, HcSplt};
use crate::transfer::TransferType;

/// Longest chain one transfer may build (SETUP + data packets + STATUS)
pub const MAX_CHAIN_LEN: usize = 130;

/// Which protocol function drives the descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TdKind {
    /// 8-byte SETUP packet, always OUT
    SetupTx,
    /// OUT data packet
    DataTx,
    /// IN data packet
    DataRx,
}

/// Protocol state of one descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TdState {
    /// Nothing issued yet
    Start,
    /// Packet issued, waiting for a handshake
    WaitAckNoError,
    /// Start-split issued, waiting for ACK/NYET from the hub
    WaitStartSplitAck,
    /// Complete-split issued, waiting for the downstream result
    WaitCompleteSplitAck,
    /// OUT packet due on the next opportunity
    SendData,
    /// OUT start-split parked until a usable microframe
    SendDataSynchronized,
    /// OUT complete-split due once the microframe moves on
    SendCompleteSplit,
    /// IN token (or IN complete-split) due on the next opportunity
    ReceiveData,
    /// IN start-split due on the next opportunity
    ReceiveStartSplit,
    /// IN start-split parked until a usable microframe
    ReceiveStartSplitSynchronized,
}

bitflags! {
    /// Descriptor flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TdFlags: u16 {
        /// This packet is short and ends the transfer
        const SHORT_FINAL = 1 << 0;
        /// Device returned fewer bytes than the max packet size
        const GOT_SHORT = 1 << 1;
        /// A short packet may skip to the next stage instead of ending the chain
        const ALT_NEXT = 1 << 2;
        /// Endpoint answered STALL
        const ERROR_STALL = 1 << 3;
        /// Descriptor ended with an error
        const ERROR_ANY = 1 << 4;
        /// Force DATA1 before the first packet (control STATUS stage)
        const SET_TOGGLE = 1 << 5;
        /// NAK seen since the last timer tick
        const DID_NAK = 1 << 6;
        /// Last descriptor of its chain
        const LAST = 1 << 7;
        /// Control STATUS stage, the toggle stays at DATA1 after completion
        const STATUS_STAGE = 1 << 8;
        /// Second NAK since the last tick, wait for the timer
        const NAK_WAIT = 1 << 9;
        /// Latched handshake already evaluated for the current token
        const HANDSHAKE_SEEN = 1 << 10;
    }
}

/// One packet-level protocol step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    /// Protocol function selector
    pub kind: TdKind,
    /// Protocol state
    pub state: TdState,
    /// Endpoint transfer type
    pub ep_type: TransferType,
    /// Offset into the transfer buffer
    pub offset: usize,
    /// Bytes still to move
    pub remainder: usize,
    /// Bytes moved so far
    pub actual: usize,
    /// Bytes pushed by the last OUT packet
    pub tx_bytes: usize,
    /// Endpoint max packet size
    pub max_packet: u16,
    /// Current data toggle (false = DATA0)
    pub toggle: bool,
    /// Claimed hardware channel
    pub channel: Option<u8>,
    /// Channel characteristics without enable bits
    pub hcchar: HcChar,
    /// Split control word (empty when no split is needed)
    pub hcsplt: HcSplt,
    /// Microframe of the last start-split
    pub curr_frame: u8,
    /// Consecutive transaction errors
    pub errcnt: u8,
    /// NYETs answered to complete-splits of the current start-split
    pub nyet_count: u8,
    /// Tokens issued for this descriptor, including retries
    pub attempts: u16,
    /// Flag set
    pub flags: TdFlags,
    /// Terminal error, if any
    pub error: Option<UsbError>,
    /// Timer value at which the next periodic packet may go out
    pub tmr_val: u8,
    /// Periodic interval in timer ticks (or frames for isochronous)
    pub tmr_res: u8,
}

impl Descriptor {
    /// Create a descriptor in `Start` state
    pub const fn new(kind: TdKind, ep_type: TransferType, hcchar: HcChar, max_packet: u16) -> Self {
        Self {
            kind,
            state: TdState::Start,
            ep_type,
            offset: 0,
            remainder: 0,
            actual: 0,
            tx_bytes: 0,
            max_packet,
            toggle: false,
            channel: None,
            hcchar,
            hcsplt: HcSplt::empty(),
            curr_frame: 0,
            errcnt: 0,
            nyet_count: 0,
            attempts: 0,
            flags: TdFlags::empty(),
            error: None,
            tmr_val: 0,
            tmr_res: 1,
        }
    }

    /// Endpoint number from the characteristics word
    #[inline(always)]
    pub const fn endpoint_number(&self) -> u8 {
        ((self.hcchar.bits() >> 11) & 0xF) as u8
    }

    /// Check if packets travel through a hub's transaction translator
    #[inline(always)]
    pub const fn is_split(&self) -> bool {
        self.hcsplt.contains(HcSplt::SPLTENA)
    }

    /// Check if the descriptor has terminated with an error
    #[inline(always)]
    pub const fn has_error(&self) -> bool {
        self.flags.contains(TdFlags::ERROR_ANY)
    }

    /// Check if a short packet ended this descriptor early
    #[inline(always)]
    pub const fn got_short(&self) -> bool {
        self.flags.contains(TdFlags::GOT_SHORT)
    }

    /// Record a terminal error
    pub fn fail(&mut self, err: UsbError) {
        self.flags |= TdFlags::ERROR_ANY;
        if err == UsbError::Stalled {
            self.flags |= TdFlags::ERROR_STALL;
        }
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    /// Account for `bytes` moved by an acknowledged packet
    pub fn advance_data(&mut self, bytes: usize) {
        let bytes = bytes.min(self.remainder);
        self.offset += bytes;
        self.remainder -= bytes;
        self.actual += bytes;
    }
}

/// Index of a descriptor in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TdHandle(u16);

impl TdHandle {
    /// Arena index
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handles of one transfer's chain in execution order
pub type Chain = heapless::Vec<TdHandle, MAX_CHAIN_LEN>;

/// Fixed-size descriptor arena with O(1) allocation
pub struct DescriptorPool<const N: usize> {
    slots: [Descriptor; N],
    allocated: [bool; N],
    free: heapless::Vec<u16, N>,
}

impl<const N: usize> DescriptorPool<N> {
    const BLANK: Descriptor = Descriptor::new(TdKind::DataTx, TransferType::Bulk, HcChar::empty(), 0);

    /// Create pool with every slot free
    pub fn new() -> Self {
        let mut free = heapless::Vec::new();
        for i in (0..N).rev() {
            // Capacity equals N, cannot fail
            let _ = free.push(i as u16);
        }
        Self {
            slots: [Self::BLANK; N],
            allocated: [false; N],
            free,
        }
    }

    /// Store `td` in a free slot
    pub fn alloc(&mut self, td: Descriptor) -> Result<TdHandle> {
        let Some(index) = self.free.pop() else {
            #[cfg(feature = "defmt")]
            defmt::warn!("descriptor pool exhausted ({} slots)", N);
            return Err(UsbError::NoResources);
        };
        self.slots[index as usize] = td;
        self.allocated[index as usize] = true;
        Ok(TdHandle(index))
    }

    /// Allocate `count` blank descriptors, all or nothing
    pub fn alloc_chain(&mut self, count: usize) -> Result<Chain> {
        if count > MAX_CHAIN_LEN || count > self.free.len() {
            return Err(UsbError::NoResources);
        }
        let mut chain = Chain::new();
        for _ in 0..count {
            let h = self.alloc(Self::BLANK)?;
            // Length checked against MAX_CHAIN_LEN above
            let _ = chain.push(h);
        }
        Ok(chain)
    }

    /// Return a descriptor to the pool
    pub fn release(&mut self, handle: TdHandle) {
        let i = handle.index();
        if i < N && self.allocated[i] {
            self.allocated[i] = false;
            self.slots[i] = Self::BLANK;
            let _ = self.free.push(handle.0);
        }
    }

    /// Return every descriptor of a chain to the pool
    pub fn release_chain(&mut self, chain: &mut Chain) {
        for h in chain.iter() {
            self.release(*h);
        }
        chain.clear();
    }

    /// Borrow a live descriptor
    pub fn get(&self, handle: TdHandle) -> Option<&Descriptor> {
        let i = handle.index();
        if i < N && self.allocated[i] {
            Some(&self.slots[i])
        } else {
            None
        }
    }

    /// Mutably borrow a live descriptor
    pub fn get_mut(&mut self, handle: TdHandle) -> Option<&mut Descriptor> {
        let i = handle.index();
        if i < N && self.allocated[i] {
            Some(&mut self.slots[i])
        } else {
            None
        }
    }

    /// Get pool utilization statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: N,
            available: self.free.len(),
        }
    }
}

impl<const N: usize> Default for DescriptorPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool utilization statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PoolStats {
    /// Total number of descriptors in the pool
    pub total: usize,
    /// Number of available (unallocated) descriptors
    pub available: usize,
}

impl PoolStats {
    /// Check if the pool is getting low on descriptors
    pub fn is_low(&self) -> bool {
        self.available * 5 < self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_alloc_release_cycle() {
        let mut pool = DescriptorPool::<8>::new();
        assert_eq!(pool.stats().available, 8);

        let mut chain = pool.alloc_chain(3).unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(pool.stats().available, 5);
        assert_ne!(chain[0], chain[1]);

        pool.release_chain(&mut chain);
        assert!(chain.is_empty());
        assert_eq!(pool.stats().available, 8);
    }

    #[test]
    fn test_chain_allocation_is_all_or_nothing() {
        let mut pool = DescriptorPool::<4>::new();
        let _held = pool.alloc_chain(3).unwrap();
        assert_eq!(pool.alloc_chain(2), Err(UsbError::NoResources));
        assert_eq!(pool.stats().available, 1);
        assert!(!pool.stats().is_low());
    }

    #[test]
    fn test_released_handle_is_dead() {
        let mut pool = DescriptorPool::<2>::new();
        let td = Descriptor::new(TdKind::SetupTx, TransferType::Control, HcChar::empty(), 8);
        let h = pool.alloc(td).unwrap();
        assert_eq!(pool.get(h).map(|d| d.kind), Some(TdKind::SetupTx));
        pool.release(h);
        assert!(pool.get(h).is_none());
        assert!(pool.get_mut(h).is_none());
        // Double release is ignored
        pool.release(h);
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn test_fail_keeps_first_error() {
        let mut td = Descriptor::new(TdKind::DataRx, TransferType::Bulk, HcChar::empty(), 64);
        td.fail(UsbError::Stalled);
        td.fail(UsbError::TransactionError);
        assert_eq!(td.error, Some(UsbError::Stalled));
        assert!(td.flags.contains(TdFlags::ERROR_STALL | TdFlags::ERROR_ANY));
    }

    #[test]
    fn test_advance_data_clamps_to_remainder() {
        let mut td = Descriptor::new(TdKind::DataTx, TransferType::Bulk, HcChar::empty(), 64);
        td.remainder = 10;
        td.advance_data(64);
        assert_eq!(td.remainder, 0);
        assert_eq!(td.actual, 10);
        assert_eq!(td.offset, 10);
    }
}
