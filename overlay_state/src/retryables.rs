//! Retryable tickets: calls submitted on the base layer that can be redeemed
//! on L2 until they time out.
//!
//! Expiry is lazy. Every ticket id is queued at creation and again at every
//! keepalive, and each block reaps at most a couple of entries from the head of
//! the queue. A ticket kept alive `n` times has `n + 1` queue entries and `n`
//! spare "timeout windows"; each reaped entry but the last consumes a window,
//! and only the last one deletes the ticket.

use ethereum_types::{Address, H160, H256, U256};
use keccak_hash::keccak;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    storage::{
        Queue, Storage, StorageBackedAddress, StorageBackedAddressOrNil, StorageBackedBigUint,
        StorageBackedBytes, StorageBackedUint64, StorageError, StorageResult,
    },
    world::transfer_balance,
};

/// How long a ticket lives, and how far each keepalive extends it.
pub const RETRYABLE_LIFETIME_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Charged by [`RetryableState::keepalive`] to prepay reaping the extra queue
/// entry it creates.
pub const RETRYABLE_REAP_PRICE: u64 = 58_000;

const TIMEOUT_QUEUE_KEY: &[u8] = &[0];
const CALLDATA_KEY: &[u8] = &[1];

const NUM_TRIES_OFFSET: u64 = 0;
const FROM_OFFSET: u64 = 1;
const TO_OFFSET: u64 = 2;
const CALLVALUE_OFFSET: u64 = 3;
const BENEFICIARY_OFFSET: u64 = 4;
const TIMEOUT_OFFSET: u64 = 5;
const TIMEOUT_WINDOWS_LEFT_OFFSET: u64 = 6;

/// Stores the result of retryable operations.
pub type RetryableResult<T> = Result<T, RetryableError>;

/// An error raised by the retryable subsystem.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RetryableError {
    #[error("retryable ticket {0:?} not found")]
    NotFound(H256),

    /// A keepalive was requested for a ticket that already lives past the
    /// caller's limit.
    #[error("ticket timeout {timeout} is already past the limit {limit}")]
    TimeoutTooFarInFuture { timeout: u64, limit: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RetryableError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetryableError::Storage(_))
    }
}

/// The account holding a ticket's callvalue until it is redeemed or expires.
pub fn retryable_escrow_address(id: H256) -> Address {
    let mut preimage = b"retryable escrow".to_vec();
    preimage.extend_from_slice(id.as_bytes());
    H160::from_slice(&keccak(preimage).as_bytes()[12..])
}

/// What [`RetryableState::try_to_reap_one`] did.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapOutcome {
    /// The queue is empty.
    QueueEmpty,
    /// The head ticket has not timed out yet.
    NotDue(H256),
    /// The head entry belonged to a ticket that no longer exists.
    DiscardedStale(H256),
    /// The ticket had a spare timeout window; its timeout moved forward.
    WindowConsumed(H256),
    /// The ticket expired and was deleted.
    Deleted(H256),
}

#[derive(Clone, Debug)]
pub struct RetryableState {
    retryables: Storage,
    timeout_queue: Queue,
}

/// One live ticket.
#[derive(Clone, Debug)]
pub struct Retryable {
    id: H256,
    backing: Storage,
    num_tries: StorageBackedUint64,
    from: StorageBackedAddress,
    to: StorageBackedAddressOrNil,
    callvalue: StorageBackedBigUint,
    beneficiary: StorageBackedAddress,
    calldata: StorageBackedBytes,
    timeout: StorageBackedUint64,
    timeout_windows_left: StorageBackedUint64,
}

/// The inputs of a new ticket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewRetryable {
    pub id: H256,
    pub timeout: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub callvalue: U256,
    pub beneficiary: Address,
    pub calldata: Vec<u8>,
}

/// The transaction that redeems a ticket.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetryTx {
    pub ticket_id: H256,
    /// Number of redeem attempts made before this one.
    pub nonce: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    #[serde(default, with = "crate::util::hex_bytes")]
    pub data: Vec<u8>,
    pub gas: u64,
    pub gas_fee_cap: U256,
    /// Receives the refund for unused gas.
    pub refund_to: Address,
    /// Upper bound on the refund.
    pub max_refund: U256,
}

impl RetryableState {
    pub fn initialize(storage: &Storage) -> StorageResult<()> {
        Queue::initialize(&storage.open_sub_storage(TIMEOUT_QUEUE_KEY))
    }

    pub fn open(storage: Storage) -> Self {
        Self {
            timeout_queue: Queue::open(storage.open_sub_storage(TIMEOUT_QUEUE_KEY)),
            retryables: storage,
        }
    }

    pub fn timeout_queue(&self) -> &Queue {
        &self.timeout_queue
    }

    fn open_ticket_storage(&self, id: H256) -> Storage {
        self.retryables.open_sub_storage(id.as_bytes())
    }

    fn retryable_at(&self, id: H256) -> Retryable {
        let sto = self.open_ticket_storage(id);
        Retryable {
            id,
            num_tries: sto.open_uint64(NUM_TRIES_OFFSET),
            from: sto.open_address(FROM_OFFSET),
            to: sto.open_address_or_nil(TO_OFFSET),
            callvalue: sto.open_big_uint(CALLVALUE_OFFSET),
            beneficiary: sto.open_address(BENEFICIARY_OFFSET),
            calldata: sto.open_bytes(CALLDATA_KEY),
            timeout: sto.open_uint64(TIMEOUT_OFFSET),
            timeout_windows_left: sto.open_uint64(TIMEOUT_WINDOWS_LEFT_OFFSET),
            backing: sto,
        }
    }

    /// Writes a new ticket and queues it for expiry. The id is assumed to be
    /// unused.
    pub fn create_retryable(&self, new: &NewRetryable) -> StorageResult<Retryable> {
        let ret = self.retryable_at(new.id);
        ret.num_tries.set(0)?;
        ret.from.set(new.from)?;
        ret.to.set(new.to)?;
        ret.callvalue.set(new.callvalue)?;
        ret.beneficiary.set(new.beneficiary)?;
        ret.calldata.set(&new.calldata)?;
        ret.timeout.set(new.timeout)?;
        ret.timeout_windows_left.set(0)?;

        self.timeout_queue.put(new.id)?;
        debug!("created retryable {:?} timing out at {}", new.id, new.timeout);
        Ok(ret)
    }

    /// The ticket `id`, unless it never existed, was deleted, or timed out
    /// before `now`. A timed-out ticket is unreachable even before it is
    /// reaped.
    pub fn open_retryable(&self, id: H256, now: u64) -> StorageResult<Option<Retryable>> {
        let timeout = self
            .open_ticket_storage(id)
            .get_u64_by_u64(TIMEOUT_OFFSET)?;
        if timeout == 0 || timeout < now {
            return Ok(None);
        }
        Ok(Some(self.retryable_at(id)))
    }

    /// Size of ticket `id`'s calldata, if it is live.
    pub fn retryable_size_bytes(&self, id: H256, now: u64) -> StorageResult<Option<u64>> {
        match self.open_retryable(id, now)? {
            Some(ret) => ret.calldata_size().map(Some),
            None => Ok(None),
        }
    }

    /// Deletes ticket `id`, paying whatever its escrow holds to the
    /// beneficiary. Returns whether there was a ticket to delete.
    pub fn delete_retryable(&self, id: H256) -> StorageResult<bool> {
        let sto = self.open_ticket_storage(id);
        if sto.get_by_u64(TIMEOUT_OFFSET)?.is_zero() {
            return Ok(false);
        }

        let beneficiary = sto.open_address(BENEFICIARY_OFFSET).get()?;
        let escrow = retryable_escrow_address(id);
        {
            let mut world = sto.world().borrow_mut();
            let amount = world.balance(escrow)?;
            transfer_balance(&mut *world, Some(escrow), Some(beneficiary), amount)?;
        }

        for offset in [
            NUM_TRIES_OFFSET,
            FROM_OFFSET,
            TO_OFFSET,
            CALLVALUE_OFFSET,
            BENEFICIARY_OFFSET,
            TIMEOUT_OFFSET,
            TIMEOUT_WINDOWS_LEFT_OFFSET,
        ] {
            sto.clear_by_u64(offset)?;
        }
        sto.open_bytes(CALLDATA_KEY).clear()?;
        info!("deleted retryable {id:?}");
        Ok(true)
    }

    /// Extends ticket `id` by one lifetime, provided its current timeout does
    /// not exceed `limit_before_add`. Returns the new timeout.
    pub fn keepalive(&self, id: H256, now: u64, limit_before_add: u64) -> RetryableResult<u64> {
        let ret = self
            .open_retryable(id, now)?
            .ok_or(RetryableError::NotFound(id))?;
        let timeout = ret.effective_timeout()?;
        if timeout > limit_before_add {
            return Err(RetryableError::TimeoutTooFarInFuture {
                timeout,
                limit: limit_before_add,
            });
        }

        // Only the last queue entry for a ticket deletes it.
        self.timeout_queue.put(id)?;
        ret.timeout_windows_left.increment()?;
        self.retryables.burner().burn(RETRYABLE_REAP_PRICE)?;
        Ok(timeout.saturating_add(RETRYABLE_LIFETIME_SECONDS))
    }

    /// Processes the head of the timeout queue, if it is due at `now`.
    pub fn try_to_reap_one(&self, now: u64) -> StorageResult<ReapOutcome> {
        let Some(id) = self.timeout_queue.peek()? else {
            return Ok(ReapOutcome::QueueEmpty);
        };
        let ret = self.retryable_at(id);
        let timeout = ret.timeout.get()?;
        if timeout == 0 {
            self.timeout_queue.get()?;
            return Ok(ReapOutcome::DiscardedStale(id));
        }
        if timeout >= now {
            return Ok(ReapOutcome::NotDue(id));
        }

        self.timeout_queue.get()?;
        let windows_left = ret.timeout_windows_left.get()?;
        if windows_left == 0 {
            self.delete_retryable(id)?;
            return Ok(ReapOutcome::Deleted(id));
        }
        ret.timeout
            .set(timeout.saturating_add(RETRYABLE_LIFETIME_SECONDS))?;
        ret.timeout_windows_left.set(windows_left - 1)?;
        Ok(ReapOutcome::WindowConsumed(id))
    }
}

impl Retryable {
    pub fn id(&self) -> H256 {
        self.id
    }

    pub fn num_tries(&self) -> StorageResult<u64> {
        self.num_tries.get()
    }

    /// Records a redeem attempt, returning the new count.
    pub fn increment_num_tries(&self) -> StorageResult<u64> {
        self.num_tries.increment()
    }

    pub fn from(&self) -> StorageResult<Address> {
        self.from.get()
    }

    pub fn to(&self) -> StorageResult<Option<Address>> {
        self.to.get()
    }

    pub fn callvalue(&self) -> StorageResult<U256> {
        self.callvalue.get()
    }

    pub fn beneficiary(&self) -> StorageResult<Address> {
        self.beneficiary.get()
    }

    pub fn calldata(&self) -> StorageResult<Vec<u8>> {
        self.calldata.get()
    }

    pub fn calldata_size(&self) -> StorageResult<u64> {
        self.calldata.size()
    }

    /// The stored timeout, not counting spare windows.
    pub fn timeout(&self) -> StorageResult<u64> {
        self.timeout.get()
    }

    pub fn timeout_windows_left(&self) -> StorageResult<u64> {
        self.timeout_windows_left.get()
    }

    /// When the ticket will actually expire, counting every spare window.
    pub fn effective_timeout(&self) -> StorageResult<u64> {
        let windows = self.timeout_windows_left.get()?;
        Ok(self
            .timeout
            .get()?
            .saturating_add(windows.saturating_mul(RETRYABLE_LIFETIME_SECONDS)))
    }

    /// The redeem transaction for this ticket. `nonce` is the number of
    /// earlier attempts.
    pub fn make_retry_tx(
        &self,
        nonce: u64,
        gas: u64,
        gas_fee_cap: U256,
        refund_to: Address,
        max_refund: U256,
    ) -> StorageResult<RetryTx> {
        Ok(RetryTx {
            ticket_id: self.id,
            nonce,
            from: self.from()?,
            to: self.to()?,
            value: self.callvalue()?,
            data: self.calldata()?,
            gas,
            gas_fee_cap,
            refund_to,
            max_refund,
        })
    }

    /// The storage view the ticket lives in.
    pub fn backing_storage(&self) -> &Storage {
        &self.backing
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::{
        burn::{Burner as _, GasMeter},
        testing_utils::{common_setup, memory_storage, TestWorld},
        world::{MemoryWorldState, WorldState as _},
    };

    const A: Address = Address::repeat_byte(0xaa);
    const B: Address = Address::repeat_byte(0xbb);

    fn open_retryables() -> (TestWorld, RetryableState) {
        common_setup();
        let (world, root) = memory_storage();
        let sto = root.open_sub_storage(&[2]);
        RetryableState::initialize(&sto).unwrap();
        (world, RetryableState::open(sto))
    }

    fn ticket(id: u64, timeout: u64) -> NewRetryable {
        NewRetryable {
            id: H256::from_low_u64_be(id),
            timeout,
            from: A,
            to: Some(B),
            callvalue: 5.into(),
            beneficiary: A,
            calldata: b"hello".to_vec(),
        }
    }

    fn fund_escrow(world: &TestWorld, id: H256, amount: U256) {
        world
            .borrow_mut()
            .add_balance(retryable_escrow_address(id), amount)
            .unwrap();
    }

    #[test]
    fn created_tickets_read_back() {
        let (_, rs) = open_retryables();
        let new = ticket(1, 1_000);
        rs.create_retryable(&new).unwrap();

        let ret = rs.open_retryable(new.id, 500).unwrap().unwrap();
        assert_eq!(ret.id(), new.id);
        assert_eq!(ret.num_tries().unwrap(), 0);
        assert_eq!(ret.from().unwrap(), A);
        assert_eq!(ret.to().unwrap(), Some(B));
        assert_eq!(ret.callvalue().unwrap(), 5.into());
        assert_eq!(ret.beneficiary().unwrap(), A);
        assert_eq!(ret.calldata().unwrap(), b"hello");
        assert_eq!(ret.timeout().unwrap(), 1_000);
        assert_eq!(ret.timeout_windows_left().unwrap(), 0);
        assert_eq!(rs.retryable_size_bytes(new.id, 500).unwrap(), Some(5));
    }

    #[test]
    fn contract_creation_tickets_have_no_recipient() {
        let (_, rs) = open_retryables();
        let new = NewRetryable {
            to: None,
            ..ticket(1, 1_000)
        };
        rs.create_retryable(&new).unwrap();
        let ret = rs.open_retryable(new.id, 0).unwrap().unwrap();
        assert_eq!(ret.to().unwrap(), None);
    }

    #[test]
    fn expired_ticket_is_reaped_and_escrow_refunded() {
        let (world, rs) = open_retryables();
        let new = ticket(1, 1_000);
        rs.create_retryable(&new).unwrap();
        fund_escrow(&world, new.id, 5.into());

        assert!(rs.open_retryable(new.id, 500).unwrap().is_some());
        assert!(rs.open_retryable(new.id, 1_000).unwrap().is_some());
        assert!(rs.open_retryable(new.id, 1_500).unwrap().is_none());

        assert_eq!(
            rs.try_to_reap_one(1_000).unwrap(),
            ReapOutcome::NotDue(new.id)
        );
        assert_eq!(
            rs.try_to_reap_one(1_500).unwrap(),
            ReapOutcome::Deleted(new.id)
        );
        assert_eq!(world.borrow().balance(A).unwrap(), 5.into());
        assert_eq!(
            world
                .borrow()
                .balance(retryable_escrow_address(new.id))
                .unwrap(),
            U256::zero()
        );
        assert_eq!(rs.try_to_reap_one(1_500).unwrap(), ReapOutcome::QueueEmpty);
        assert!(!rs.delete_retryable(new.id).unwrap());
    }

    #[test]
    fn deleting_clears_every_slot() {
        let (world, rs) = open_retryables();
        let new = ticket(1, 1_000);
        let before = world
            .borrow()
            .storage_len(overlay_common::OVERLAY_STATE_ADDRESS);
        rs.create_retryable(&new).unwrap();
        assert!(rs.delete_retryable(new.id).unwrap());
        // Only the queue's entry and counters are left behind.
        assert_eq!(
            world
                .borrow()
                .storage_len(overlay_common::OVERLAY_STATE_ADDRESS),
            before + 1
        );
        assert_eq!(
            rs.try_to_reap_one(0).unwrap(),
            ReapOutcome::DiscardedStale(new.id)
        );
    }

    #[test]
    fn keepalive_extends_by_one_lifetime() {
        let (_, rs) = open_retryables();
        let new = ticket(1, 1_000);
        rs.create_retryable(&new).unwrap();

        let extended = rs.keepalive(new.id, 0, 1_000).unwrap();
        assert_eq!(extended, 1_000 + RETRYABLE_LIFETIME_SECONDS);
        let ret = rs.open_retryable(new.id, 0).unwrap().unwrap();
        assert_eq!(ret.effective_timeout().unwrap(), extended);
        assert_eq!(rs.timeout_queue().size().unwrap(), 2);

        assert_eq!(
            rs.keepalive(new.id, 0, 1_000).unwrap_err(),
            RetryableError::TimeoutTooFarInFuture {
                timeout: extended,
                limit: 1_000
            }
        );
        assert_eq!(
            rs.keepalive(H256::repeat_byte(9), 0, u64::MAX).unwrap_err(),
            RetryableError::NotFound(H256::repeat_byte(9))
        );
    }

    #[test]
    fn keepalive_charges_the_reap_price() {
        let (_, shared) = MemoryWorldState::new_shared();
        let meter = Rc::new(GasMeter::new(u64::MAX));
        let root = Storage::new(shared, meter.clone());
        RetryableState::initialize(&root).unwrap();
        let rs = RetryableState::open(root);
        let new = ticket(1, 1_000);
        rs.create_retryable(&new).unwrap();

        let before = meter.burned();
        rs.keepalive(new.id, 0, u64::MAX).unwrap();
        assert!(meter.burned() - before >= RETRYABLE_REAP_PRICE);
    }

    #[test]
    fn duplicates_delete_only_on_the_last_entry() {
        let (world, rs) = open_retryables();
        let new = ticket(1, 1_000);
        rs.create_retryable(&new).unwrap();
        fund_escrow(&world, new.id, 5.into());
        for _ in 0..3 {
            rs.keepalive(new.id, 0, u64::MAX).unwrap();
        }
        assert_eq!(rs.timeout_queue().size().unwrap(), 4);

        let far_future = u64::MAX;
        let outcomes: Vec<_> = (0..4)
            .map(|_| rs.try_to_reap_one(far_future).unwrap())
            .collect();
        assert_eq!(
            outcomes,
            vec![
                ReapOutcome::WindowConsumed(new.id),
                ReapOutcome::WindowConsumed(new.id),
                ReapOutcome::WindowConsumed(new.id),
                ReapOutcome::Deleted(new.id),
            ]
        );
        assert!(rs.timeout_queue().is_empty().unwrap());
        assert_eq!(world.borrow().balance(A).unwrap(), 5.into());
    }

    #[test]
    fn consumed_windows_keep_the_ticket_alive() {
        let (_, rs) = open_retryables();
        let new = ticket(1, 1_000);
        rs.create_retryable(&new).unwrap();
        rs.keepalive(new.id, 0, u64::MAX).unwrap();

        assert_eq!(
            rs.try_to_reap_one(1_001).unwrap(),
            ReapOutcome::WindowConsumed(new.id)
        );
        let ret = rs.open_retryable(new.id, 1_001).unwrap().unwrap();
        assert_eq!(ret.timeout().unwrap(), 1_000 + RETRYABLE_LIFETIME_SECONDS);
        assert_eq!(ret.timeout_windows_left().unwrap(), 0);
        assert_eq!(
            rs.try_to_reap_one(1_001).unwrap(),
            ReapOutcome::NotDue(new.id)
        );
    }

    #[test]
    fn retry_tx_carries_the_ticket() {
        let (_, rs) = open_retryables();
        let new = ticket(7, 1_000);
        let ret = rs.create_retryable(&new).unwrap();
        let tries = ret.increment_num_tries().unwrap();
        let tx = ret
            .make_retry_tx(tries - 1, 50_000, 10.into(), B, 500_000.into())
            .unwrap();
        assert_eq!(
            tx,
            RetryTx {
                ticket_id: new.id,
                nonce: 0,
                from: A,
                to: Some(B),
                value: 5.into(),
                data: b"hello".to_vec(),
                gas: 50_000,
                gas_fee_cap: 10.into(),
                refund_to: B,
                max_refund: 500_000.into(),
            }
        );
    }
}
