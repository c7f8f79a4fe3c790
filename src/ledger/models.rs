use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Metadata of the last transaction submitted on one axis of a record.
///
/// `expected` is the on-chain figure the confirmation check compares against:
/// a minimum balance for transfers into an address, a residual ceiling for
/// sweeps out of one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxMeta {
    pub tx_hash: Option<String>,
    pub nonce: Option<u64>,
    #[serde(with = "rust_decimal::serde::str_option", default)]
    pub expected: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
}

impl TxMeta {
    pub fn new(
        tx_hash: Option<String>,
        nonce: Option<u64>,
        expected: Option<Decimal>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_hash,
            nonce,
            expected,
            submitted_at,
        }
    }
}

/// Per-axis transaction metadata, persisted as a single JSON document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxLog(BTreeMap<String, TxMeta>);

impl TxLog {
    pub fn get(&self, axis: &str) -> Option<&TxMeta> {
        self.0.get(axis)
    }

    pub fn record(&mut self, axis: &str, meta: TxMeta) {
        self.0.insert(axis.to_string(), meta);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Abstract shape shared by every settlement record family.
///
/// A record carries one or more status axes. All of a family's axes share one
/// status type, so the stage controller can move any of them generically.
pub trait SettlementRecord: Clone + Send + Sync + 'static {
    type Axis: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Status: Copy + Eq + fmt::Debug + Send + Sync + 'static;

    const FAMILY: &'static str;

    fn id(&self) -> Uuid;

    fn genesis_hash(&self) -> &str;

    fn status(&self, axis: Self::Axis) -> Self::Status;

    /// Moves one axis and stamps `updated_at`, the record's timeout clock
    fn set_status(&mut self, axis: Self::Axis, status: Self::Status, now: DateTime<Utc>);

    fn updated_at(&self) -> DateTime<Utc>;

    fn transactions(&self) -> &TxLog;

    fn transactions_mut(&mut self) -> &mut TxLog;

    /// True once every axis sits in its terminal success state
    fn is_complete(&self) -> bool;

    fn transaction(&self, axis: Self::Axis) -> Option<&TxMeta> {
        self.transactions().get(&axis.to_string())
    }

    fn record_transaction(&mut self, axis: Self::Axis, meta: TxMeta) {
        self.transactions_mut().record(&axis.to_string(), meta);
    }
}

// ========== GENERIC STAGE STATUS ==========

/// Status of one independent axis.
///
/// `NotStarted` doubles as the "waiting" entry state of treasure PRL transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    Pending,
    Confirmed,
    Error,
}

impl StageStatus {
    pub fn code(self) -> i16 {
        match self {
            StageStatus::NotStarted => 0,
            StageStatus::Pending => 1,
            StageStatus::Confirmed => 2,
            StageStatus::Error => -1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(StageStatus::NotStarted),
            1 => Some(StageStatus::Pending),
            2 => Some(StageStatus::Confirmed),
            -1 => Some(StageStatus::Error),
            _ => None,
        }
    }
}

// ========== BROKER PAYMENT ==========

/// Which side of the upload this broker played
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    Alpha,
    Beta,
}

impl BrokerType {
    pub fn code(self) -> i16 {
        match self {
            BrokerType::Alpha => 1,
            BrokerType::Beta => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(BrokerType::Alpha),
            2 => Some(BrokerType::Beta),
            _ => None,
        }
    }
}

/// Combined lifecycle of a broker-to-broker payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    AlphaPaymentPending,
    AlphaPaymentConfirmed,
    GasPaymentPending,
    GasPaymentConfirmed,
    BetaPaymentPending,
    BetaPaymentConfirmed,
    GasReclaimPending,
    GasReclaimConfirmed,
    GasPaymentError,
    BetaPaymentError,
    GasReclaimError,
}

/// (pending, error twin, retry target) for each payment step that can fail
pub const PAYMENT_TRANSITIONS: [(PaymentStatus, PaymentStatus, PaymentStatus); 3] = [
    (
        PaymentStatus::GasPaymentPending,
        PaymentStatus::GasPaymentError,
        PaymentStatus::AlphaPaymentConfirmed,
    ),
    (
        PaymentStatus::BetaPaymentPending,
        PaymentStatus::BetaPaymentError,
        PaymentStatus::GasPaymentConfirmed,
    ),
    (
        PaymentStatus::GasReclaimPending,
        PaymentStatus::GasReclaimError,
        PaymentStatus::BetaPaymentConfirmed,
    ),
];

impl PaymentStatus {
    pub fn code(self) -> i16 {
        match self {
            PaymentStatus::AlphaPaymentPending => 1,
            PaymentStatus::AlphaPaymentConfirmed => 2,
            PaymentStatus::GasPaymentPending => 3,
            PaymentStatus::GasPaymentConfirmed => 4,
            PaymentStatus::BetaPaymentPending => 5,
            PaymentStatus::BetaPaymentConfirmed => 6,
            PaymentStatus::GasReclaimPending => 7,
            PaymentStatus::GasReclaimConfirmed => 8,
            PaymentStatus::GasPaymentError => -3,
            PaymentStatus::BetaPaymentError => -5,
            PaymentStatus::GasReclaimError => -7,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(PaymentStatus::AlphaPaymentPending),
            2 => Some(PaymentStatus::AlphaPaymentConfirmed),
            3 => Some(PaymentStatus::GasPaymentPending),
            4 => Some(PaymentStatus::GasPaymentConfirmed),
            5 => Some(PaymentStatus::BetaPaymentPending),
            6 => Some(PaymentStatus::BetaPaymentConfirmed),
            7 => Some(PaymentStatus::GasReclaimPending),
            8 => Some(PaymentStatus::GasReclaimConfirmed),
            -3 => Some(PaymentStatus::GasPaymentError),
            -5 => Some(PaymentStatus::BetaPaymentError),
            -7 => Some(PaymentStatus::GasReclaimError),
            _ => None,
        }
    }

    /// Error twin of a pending status
    pub fn error_of(self) -> Option<Self> {
        PAYMENT_TRANSITIONS
            .iter()
            .find(|(pending, _, _)| *pending == self)
            .map(|(_, error, _)| *error)
    }

    /// Where an error status is staged for retry
    pub fn retry_of(self) -> Option<Self> {
        PAYMENT_TRANSITIONS
            .iter()
            .find(|(_, error, _)| *error == self)
            .map(|(_, _, retry)| *retry)
    }

    pub fn is_error(self) -> bool {
        self.retry_of().is_some()
    }
}

/// The payment lifecycle is a single axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentAxis {
    Lifecycle,
}

impl fmt::Display for PaymentAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payment")
    }
}

/// Payment owed between the alpha and beta brokers of one upload session
#[derive(Debug, Clone, Serialize)]
pub struct BrokerPayment {
    pub id: Uuid,
    pub genesis_hash: String,
    pub broker_type: BrokerType,
    pub eth_addr_alpha: String,
    pub eth_addr_beta: String,
    /// Only alpha-side records hold the key; beta never signs from alpha's address
    #[serde(skip_serializing)]
    pub alpha_encrypted_key: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_cost: Decimal,
    pub status: PaymentStatus,
    pub transactions: TxLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BrokerPayment {
    pub fn new_alpha(
        genesis_hash: impl Into<String>,
        eth_addr_alpha: impl Into<String>,
        eth_addr_beta: impl Into<String>,
        alpha_encrypted_key: impl Into<String>,
        total_cost: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            genesis_hash: genesis_hash.into(),
            broker_type: BrokerType::Alpha,
            eth_addr_alpha: eth_addr_alpha.into(),
            eth_addr_beta: eth_addr_beta.into(),
            alpha_encrypted_key: Some(alpha_encrypted_key.into()),
            total_cost,
            status: PaymentStatus::AlphaPaymentPending,
            transactions: TxLog::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_beta(
        genesis_hash: impl Into<String>,
        eth_addr_alpha: impl Into<String>,
        eth_addr_beta: impl Into<String>,
        total_cost: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            genesis_hash: genesis_hash.into(),
            broker_type: BrokerType::Beta,
            eth_addr_alpha: eth_addr_alpha.into(),
            eth_addr_beta: eth_addr_beta.into(),
            alpha_encrypted_key: None,
            total_cost,
            status: PaymentStatus::AlphaPaymentPending,
            transactions: TxLog::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_alpha(&self) -> bool {
        self.broker_type == BrokerType::Alpha
    }
}

impl SettlementRecord for BrokerPayment {
    type Axis = PaymentAxis;
    type Status = PaymentStatus;

    const FAMILY: &'static str = "broker_payment";

    fn id(&self) -> Uuid {
        self.id
    }

    fn genesis_hash(&self) -> &str {
        &self.genesis_hash
    }

    fn status(&self, _axis: PaymentAxis) -> PaymentStatus {
        self.status
    }

    fn set_status(&mut self, _axis: PaymentAxis, status: PaymentStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn transactions(&self) -> &TxLog {
        &self.transactions
    }

    fn transactions_mut(&mut self) -> &mut TxLog {
        &mut self.transactions
    }

    fn is_complete(&self) -> bool {
        match self.broker_type {
            BrokerType::Alpha => self.status == PaymentStatus::GasReclaimConfirmed,
            BrokerType::Beta => self.status == PaymentStatus::BetaPaymentConfirmed,
        }
    }
}

// ========== TREASURE BURIAL ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BurialAxis {
    Prl,
    Gas,
    Bury,
}

impl fmt::Display for BurialAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BurialAxis::Prl => "prl",
            BurialAxis::Gas => "gas",
            BurialAxis::Bury => "bury",
        };
        write!(f, "{}", name)
    }
}

/// Treasure to be funded and buried at an engine-controlled address
#[derive(Debug, Clone, Serialize)]
pub struct TreasuryBurial {
    pub id: Uuid,
    pub genesis_hash: String,
    pub eth_addr: String,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub prl_amount: Decimal,
    pub prl_status: StageStatus,
    pub gas_status: StageStatus,
    pub bury_status: StageStatus,
    pub transactions: TxLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TreasuryBurial {
    pub fn new(
        genesis_hash: impl Into<String>,
        eth_addr: impl Into<String>,
        encrypted_key: impl Into<String>,
        prl_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            genesis_hash: genesis_hash.into(),
            eth_addr: eth_addr.into(),
            encrypted_key: encrypted_key.into(),
            prl_amount,
            prl_status: StageStatus::NotStarted,
            gas_status: StageStatus::NotStarted,
            bury_status: StageStatus::NotStarted,
            transactions: TxLog::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl SettlementRecord for TreasuryBurial {
    type Axis = BurialAxis;
    type Status = StageStatus;

    const FAMILY: &'static str = "treasury_burial";

    fn id(&self) -> Uuid {
        self.id
    }

    fn genesis_hash(&self) -> &str {
        &self.genesis_hash
    }

    fn status(&self, axis: BurialAxis) -> StageStatus {
        match axis {
            BurialAxis::Prl => self.prl_status,
            BurialAxis::Gas => self.gas_status,
            BurialAxis::Bury => self.bury_status,
        }
    }

    fn set_status(&mut self, axis: BurialAxis, status: StageStatus, now: DateTime<Utc>) {
        match axis {
            BurialAxis::Prl => self.prl_status = status,
            BurialAxis::Gas => self.gas_status = status,
            BurialAxis::Bury => self.bury_status = status,
        }
        self.updated_at = now;
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn transactions(&self) -> &TxLog {
        &self.transactions
    }

    fn transactions_mut(&mut self) -> &mut TxLog {
        &mut self.transactions
    }

    fn is_complete(&self) -> bool {
        self.prl_status == StageStatus::Confirmed
            && self.gas_status == StageStatus::Confirmed
            && self.bury_status == StageStatus::Confirmed
    }
}

// ========== CLAIMS ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimAxis {
    Gas,
    Claim,
    Reclaim,
}

impl fmt::Display for ClaimAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClaimAxis::Gas => "gas",
            ClaimAxis::Claim => "claim",
            ClaimAxis::Reclaim => "reclaim",
        };
        write!(f, "{}", name)
    }
}

/// A buried reward being redeemed out of an engine-controlled address
pub trait ClaimRecord: SettlementRecord<Axis = ClaimAxis, Status = StageStatus> {
    fn treasure_address(&self) -> &str;

    fn treasure_encrypted_key(&self) -> &str;

    /// `None` pays the claim out to the main wallet
    fn receiver_address(&self) -> Option<&str>;

    fn starting_claim_clock(&self) -> Option<i64>;

    fn set_starting_claim_clock(&mut self, clock: i64);
}

macro_rules! claim_axes {
    ($record:ty, $family:literal) => {
        impl SettlementRecord for $record {
            type Axis = ClaimAxis;
            type Status = StageStatus;

            const FAMILY: &'static str = $family;

            fn id(&self) -> Uuid {
                self.id
            }

            fn genesis_hash(&self) -> &str {
                &self.genesis_hash
            }

            fn status(&self, axis: ClaimAxis) -> StageStatus {
                match axis {
                    ClaimAxis::Gas => self.gas_status,
                    ClaimAxis::Claim => self.claim_status,
                    ClaimAxis::Reclaim => self.reclaim_status,
                }
            }

            fn set_status(&mut self, axis: ClaimAxis, status: StageStatus, now: DateTime<Utc>) {
                match axis {
                    ClaimAxis::Gas => self.gas_status = status,
                    ClaimAxis::Claim => self.claim_status = status,
                    ClaimAxis::Reclaim => self.reclaim_status = status,
                }
                self.updated_at = now;
            }

            fn updated_at(&self) -> DateTime<Utc> {
                self.updated_at
            }

            fn transactions(&self) -> &TxLog {
                &self.transactions
            }

            fn transactions_mut(&mut self) -> &mut TxLog {
                &mut self.transactions
            }

            fn is_complete(&self) -> bool {
                self.gas_status == StageStatus::Confirmed
                    && self.claim_status == StageStatus::Confirmed
                    && self.reclaim_status == StageStatus::Confirmed
            }
        }
    };
}

/// A webnode redeeming a buried treasure to its own address
#[derive(Debug, Clone, Serialize)]
pub struct TreasuryClaim {
    pub id: Uuid,
    pub genesis_hash: String,
    pub sector_idx: i32,
    pub treasure_eth_addr: String,
    #[serde(skip_serializing)]
    pub treasure_encrypted_key: String,
    pub receiver_eth_addr: String,
    pub starting_claim_clock: Option<i64>,
    pub gas_status: StageStatus,
    pub claim_status: StageStatus,
    pub reclaim_status: StageStatus,
    pub transactions: TxLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TreasuryClaim {
    pub fn new(
        genesis_hash: impl Into<String>,
        sector_idx: i32,
        treasure_eth_addr: impl Into<String>,
        treasure_encrypted_key: impl Into<String>,
        receiver_eth_addr: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            genesis_hash: genesis_hash.into(),
            sector_idx,
            treasure_eth_addr: treasure_eth_addr.into(),
            treasure_encrypted_key: treasure_encrypted_key.into(),
            receiver_eth_addr: receiver_eth_addr.into(),
            starting_claim_clock: None,
            gas_status: StageStatus::NotStarted,
            claim_status: StageStatus::NotStarted,
            reclaim_status: StageStatus::NotStarted,
            transactions: TxLog::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

claim_axes!(TreasuryClaim, "treasury_claim");

impl ClaimRecord for TreasuryClaim {
    fn treasure_address(&self) -> &str {
        &self.treasure_eth_addr
    }

    fn treasure_encrypted_key(&self) -> &str {
        &self.treasure_encrypted_key
    }

    fn receiver_address(&self) -> Option<&str> {
        Some(&self.receiver_eth_addr)
    }

    fn starting_claim_clock(&self) -> Option<i64> {
        self.starting_claim_clock
    }

    fn set_starting_claim_clock(&mut self, clock: i64) {
        self.starting_claim_clock = Some(clock);
    }
}

/// Unused PRL left at a completed upload's treasure address, reclaimed to the
/// main wallet
#[derive(Debug, Clone, Serialize)]
pub struct LegacyReclaim {
    pub id: Uuid,
    pub genesis_hash: String,
    pub eth_addr: String,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    pub starting_claim_clock: Option<i64>,
    pub gas_status: StageStatus,
    pub claim_status: StageStatus,
    pub reclaim_status: StageStatus,
    pub transactions: TxLog,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LegacyReclaim {
    pub fn new(
        genesis_hash: impl Into<String>,
        eth_addr: impl Into<String>,
        encrypted_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            genesis_hash: genesis_hash.into(),
            eth_addr: eth_addr.into(),
            encrypted_key: encrypted_key.into(),
            starting_claim_clock: None,
            gas_status: StageStatus::NotStarted,
            claim_status: StageStatus::NotStarted,
            reclaim_status: StageStatus::NotStarted,
            transactions: TxLog::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

claim_axes!(LegacyReclaim, "legacy_reclaim");

impl ClaimRecord for LegacyReclaim {
    fn treasure_address(&self) -> &str {
        &self.eth_addr
    }

    fn treasure_encrypted_key(&self) -> &str {
        &self.encrypted_key
    }

    fn receiver_address(&self) -> Option<&str> {
        None
    }

    fn starting_claim_clock(&self) -> Option<i64> {
        self.starting_claim_clock
    }

    fn set_starting_claim_clock(&mut self, clock: i64) {
        self.starting_claim_clock = Some(clock);
    }
}
