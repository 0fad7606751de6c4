//! Message Model
//!
//! Typed representations of the server-pushed message stream. Every
//! decoded payload becomes exactly one [`TransaqMessage`] variant; the
//! dispatch engine moves the value into the handler and keeps nothing.
//!
//! Variants map one-to-one onto connector root tags, except
//! `server_status`, which splits into [`TransaqMessage::ConnectAck`] and
//! [`TransaqMessage::DisconnectNotice`] on its `connected` attribute.
//! Packet roots (`quotations`, `orders`, `trades`, `alltrades`,
//! `markets`) carry their entries as a `Vec`, preserving wire order.
//!
//! Prices and money are `rust_decimal::Decimal`; lot counts are `i64`;
//! timestamps are naive datetimes in the connector's exchange timezone.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::codec::{DecodeError, XmlElement, parse_datetime, parse_decimal, parse_i32, parse_i64};

/// One decoded server message.
///
/// Closed set: unknown root tags are a [`DecodeError`], not a variant.
#[derive(Debug, Clone, PartialEq)]
pub enum TransaqMessage {
    /// The connector established its broker link (`server_status connected="true"`).
    ConnectAck(ServerStatus),
    /// The connector lost or refused its broker link
    /// (`server_status connected="false"` or `"error"`).
    DisconnectNotice(ServerStatus),
    /// Per-command acknowledgement (`result`).
    CommandResult(CommandResult),
    /// Free-text server error (`error`).
    ServerError(ServerError),
    /// Instrument reference data (`sec_info`).
    SecurityInfo(SecurityInfo),
    /// Quotation snapshot entries (`quotations`).
    Quotes(Vec<Quotation>),
    /// Order lifecycle updates (`orders`).
    OrderStatus(Vec<Order>),
    /// Own executed trades (`trades`).
    Trades(Vec<OwnTrade>),
    /// Anonymous market tape (`alltrades`).
    AllTrades(Vec<TickTrade>),
    /// Historical candle batch (`candles`).
    Candles(CandlePacket),
    /// Market directory entries (`markets`).
    Markets(Vec<Market>),
    /// Client account descriptor (`client`).
    ClientAccount(ClientAccount),
}

impl TransaqMessage {
    /// Root tag family this message was decoded from, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectAck(_) | Self::DisconnectNotice(_) => "server_status",
            Self::CommandResult(_) => "result",
            Self::ServerError(_) => "error",
            Self::SecurityInfo(_) => "sec_info",
            Self::Quotes(_) => "quotations",
            Self::OrderStatus(_) => "orders",
            Self::Trades(_) => "trades",
            Self::AllTrades(_) => "alltrades",
            Self::Candles(_) => "candles",
            Self::Markets(_) => "markets",
            Self::ClientAccount(_) => "client",
        }
    }
}

// =============================================================================
// Shared enums
// =============================================================================

/// Broker-link state reported by `server_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    /// Link to the broker is up.
    Connected,
    /// Link is down (orderly).
    Disconnected,
    /// Link is down with an error; `text` carries the reason.
    Error,
}

/// Order direction, `B`/`S` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Buy (`B`).
    Buy,
    /// Sell (`S`).
    Sell,
}

impl Side {
    pub(crate) fn from_wire(element: &str, field: &str, value: &str) -> Result<Self, DecodeError> {
        match value {
            "B" => Ok(Self::Buy),
            "S" => Ok(Self::Sell),
            other => Err(DecodeError::malformed(
                element,
                field,
                format!("expected B or S, got `{other}`"),
            )),
        }
    }

    /// Wire spelling, used by the command encoder.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Buy => "B",
            Self::Sell => "S",
        }
    }
}

/// Order lifecycle state.
///
/// The connector's vocabulary is open-ended (stop-order states appear on
/// some servers); unrecognized values are preserved in `Other` rather
/// than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderState {
    /// Live on the exchange.
    Active,
    /// Being forwarded to the exchange.
    Forwarding,
    /// State unknown due to an exchange link problem.
    Inactive,
    /// Fully executed.
    Matched,
    /// Cancelled by the trader after reaching the market.
    Cancelled,
    /// Rejected by the broker.
    Denied,
    /// Rejected by the exchange.
    Rejected,
    /// Refused by the counterparty.
    Refused,
    /// Annulled by the exchange.
    Removed,
    /// Validity period elapsed.
    Expired,
    /// Could not be placed on the exchange.
    Failed,
    /// Conditional order waiting for its trigger.
    Watching,
    /// Conditional order stopped before its trigger fired.
    Disabled,
    /// Activation time not yet reached.
    Wait,
    /// No state reported.
    None,
    /// Any state outside the common vocabulary, verbatim.
    Other(String),
}

impl OrderState {
    fn from_wire(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "forwarding" => Self::Forwarding,
            "inactive" => Self::Inactive,
            "matched" => Self::Matched,
            "cancelled" => Self::Cancelled,
            "denied" => Self::Denied,
            "rejected" => Self::Rejected,
            "refused" => Self::Refused,
            "removed" => Self::Removed,
            "expired" => Self::Expired,
            "failed" => Self::Failed,
            "watching" => Self::Watching,
            "disabled" => Self::Disabled,
            "wait" => Self::Wait,
            "none" => Self::None,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the order can still produce fills.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::Forwarding | Self::Watching | Self::Wait
        )
    }
}

/// Continuation marker on a candle batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleStatus {
    /// History exhausted, nothing earlier exists.
    EndOfData,
    /// The requested count was delivered; request again for more.
    Fulfilled,
    /// Another batch for this request follows.
    MoreToCome,
    /// Data currently unavailable, retry later.
    Unavailable,
}

impl CandleStatus {
    fn from_code(element: &str, code: i32) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(Self::EndOfData),
            1 => Ok(Self::Fulfilled),
            2 => Ok(Self::MoreToCome),
            3 => Ok(Self::Unavailable),
            other => Err(DecodeError::malformed(
                element,
                "status",
                format!("expected 0..=3, got {other}"),
            )),
        }
    }
}

// =============================================================================
// Payload structs
// =============================================================================

/// Connector link state (`server_status`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    /// Link state.
    pub status: ConnectorStatus,
    /// The connector is trying to restore a lost link on its own.
    pub recovering: bool,
    /// Broker server timezone (`server_tz`), when reported.
    pub timezone: Option<String>,
    /// Text body; the failure reason when `status` is `Error`.
    pub text: Option<String>,
}

impl ServerStatus {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        let status = match element.require_attr("connected")? {
            "true" => ConnectorStatus::Connected,
            "false" => ConnectorStatus::Disconnected,
            "error" => ConnectorStatus::Error,
            other => {
                return Err(DecodeError::malformed(
                    "server_status",
                    "connected",
                    format!("expected true/false/error, got `{other}`"),
                ));
            }
        };
        Ok(Self {
            status,
            recovering: element.attr("recover") == Some("true"),
            timezone: element.attr("server_tz").map(str::to_string),
            text: Some(element.text.clone()).filter(|text| !text.is_empty()),
        })
    }

    /// The failure reason, present only for `Error` status.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        match self.status {
            ConnectorStatus::Error => self.text.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn into_message(self) -> TransaqMessage {
        match self.status {
            ConnectorStatus::Connected => TransaqMessage::ConnectAck(self),
            _ => TransaqMessage::DisconnectNotice(self),
        }
    }
}

/// Per-command acknowledgement (`result`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Whether the connector accepted the command.
    pub success: bool,
    /// Server-assigned transaction id, when the command opens one.
    pub transaction_id: Option<i64>,
    /// Diagnostic text (`message` child), usually on failure.
    pub text: Option<String>,
}

impl CommandResult {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        let success = match element.require_attr("success")? {
            "true" => true,
            "false" => false,
            other => {
                return Err(DecodeError::malformed(
                    "result",
                    "success",
                    format!("expected true/false, got `{other}`"),
                ));
            }
        };
        let transaction_id = element
            .attr("transactionid")
            .map(|value| parse_i64("result", "transactionid", value))
            .transpose()?;
        Ok(Self {
            success,
            transaction_id,
            text: element.child_text("message").map(str::to_string),
        })
    }
}

/// Free-text server error (`error`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Error text as sent by the connector.
    pub text: String,
}

impl ServerError {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            text: element.text.clone(),
        })
    }
}

/// Instrument reference data (`sec_info`).
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityInfo {
    /// Session-scoped numeric security id.
    pub secid: Option<i32>,
    /// Trading board the instrument was resolved on.
    pub board: String,
    /// Instrument ticker.
    pub seccode: String,
    /// Full instrument name.
    pub secname: Option<String>,
    /// Market id.
    pub market: Option<i32>,
    /// Price floor (futures).
    pub min_price: Option<Decimal>,
    /// Price cap (futures).
    pub max_price: Option<Decimal>,
    /// Buyer margin requirement.
    pub buy_deposit: Option<Decimal>,
    /// Seller margin requirement.
    pub sell_deposit: Option<Decimal>,
    /// Monetary value of one price point.
    pub point_cost: Option<Decimal>,
}

impl SecurityInfo {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            secid: opt_attr_i32(element, "secid")?,
            board: element.require_child_text("board")?.to_string(),
            seccode: element.require_child_text("seccode")?.to_string(),
            secname: element.child_text("secname").map(str::to_string),
            market: opt_child_i32(element, "market")?,
            min_price: opt_child_decimal(element, "minprice")?,
            max_price: opt_child_decimal(element, "maxprice")?,
            buy_deposit: opt_child_decimal(element, "buy_deposit")?,
            sell_deposit: opt_child_decimal(element, "sell_deposit")?,
            point_cost: opt_child_decimal(element, "point_cost")?,
        })
    }
}

/// One quotation snapshot entry (`quotation` inside `quotations`).
///
/// Every field beyond the instrument key is delta-style: the connector
/// sends only what changed since the previous snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Quotation {
    /// Session-scoped numeric security id.
    pub secid: Option<i32>,
    /// Trading board.
    pub board: String,
    /// Instrument ticker.
    pub seccode: String,
    /// Best bid price.
    pub best_bid: Option<Decimal>,
    /// Best offer price.
    pub best_offer: Option<Decimal>,
    /// Last trade price.
    pub last_price: Option<Decimal>,
    /// Last trade size in lots.
    pub last_quantity: Option<i64>,
    /// Last trade time.
    pub last_time: Option<NaiveDateTime>,
    /// Session open price.
    pub open: Option<Decimal>,
    /// Session high.
    pub high: Option<Decimal>,
    /// Session low.
    pub low: Option<Decimal>,
    /// Previous session close.
    pub close: Option<Decimal>,
    /// Change against the previous session's last price.
    pub change: Option<Decimal>,
    /// Session volume in lots.
    pub volume_today: Option<i64>,
    /// Instrument trading status text.
    pub trade_status: Option<String>,
}

impl Quotation {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            secid: opt_attr_i32(element, "secid")?,
            board: element.require_child_text("board")?.to_string(),
            seccode: element.require_child_text("seccode")?.to_string(),
            best_bid: opt_child_decimal(element, "bid")?,
            best_offer: opt_child_decimal(element, "offer")?,
            last_price: opt_child_decimal(element, "last")?,
            last_quantity: opt_child_i64(element, "quantity")?,
            last_time: opt_child_datetime(element, "time")?,
            open: opt_child_decimal(element, "open")?,
            high: opt_child_decimal(element, "high")?,
            low: opt_child_decimal(element, "low")?,
            close: opt_child_decimal(element, "closeprice")?,
            change: opt_child_decimal(element, "change")?,
            volume_today: opt_child_i64(element, "voltoday")?,
            trade_status: element.child_text("tradingstatus").map(str::to_string),
        })
    }
}

/// One order lifecycle update (`order` inside `orders`).
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    /// Connector transaction id the order was created under.
    pub transaction_id: i64,
    /// Exchange order number, absent until the exchange registers it.
    pub order_no: Option<i64>,
    /// Trading board.
    pub board: String,
    /// Instrument ticker.
    pub seccode: String,
    /// Client account id.
    pub client: Option<String>,
    /// Current lifecycle state.
    pub state: OrderState,
    /// Direction.
    pub side: Side,
    /// Limit price; absent for market orders.
    pub price: Option<Decimal>,
    /// Ordered quantity in lots.
    pub quantity: Option<i64>,
    /// Unfilled remainder in lots.
    pub balance: Option<i64>,
    /// Exchange registration time.
    pub time: Option<NaiveDateTime>,
    /// Free-form order note.
    pub broker_ref: Option<String>,
    /// Exchange message when placement was refused.
    pub result: Option<String>,
}

impl Order {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        let transaction_id = parse_i64(
            "order",
            "transactionid",
            element.require_attr("transactionid")?,
        )?;
        Ok(Self {
            transaction_id,
            order_no: opt_child_i64(element, "orderno")?,
            board: element.require_child_text("board")?.to_string(),
            seccode: element.require_child_text("seccode")?.to_string(),
            client: element.child_text("client").map(str::to_string),
            state: OrderState::from_wire(element.require_child_text("status")?),
            side: Side::from_wire("order", "buysell", element.require_child_text("buysell")?)?,
            price: opt_child_decimal(element, "price")?,
            quantity: opt_child_i64(element, "quantity")?,
            balance: opt_child_i64(element, "balance")?,
            time: opt_child_datetime(element, "time")?,
            broker_ref: element.child_text("brokerref").map(str::to_string),
            result: element.child_text("result").map(str::to_string),
        })
    }
}

/// One own executed trade (`trade` inside `trades`).
#[derive(Debug, Clone, PartialEq)]
pub struct OwnTrade {
    /// Exchange trade number.
    pub trade_no: i64,
    /// Exchange number of the order that produced the fill.
    pub order_no: Option<i64>,
    /// Trading board.
    pub board: String,
    /// Instrument ticker.
    pub seccode: String,
    /// Client account id.
    pub client: Option<String>,
    /// Direction.
    pub side: Side,
    /// Execution time.
    pub time: NaiveDateTime,
    /// Execution price.
    pub price: Decimal,
    /// Filled quantity in lots.
    pub quantity: Option<i64>,
    /// Trade value in the instrument currency.
    pub value: Option<Decimal>,
    /// Commission charged.
    pub commission: Option<Decimal>,
    /// Position in the instrument after this fill.
    pub current_position: Option<i64>,
}

impl OwnTrade {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            trade_no: parse_i64("trade", "tradeno", element.require_child_text("tradeno")?)?,
            order_no: opt_child_i64(element, "orderno")?,
            board: element.require_child_text("board")?.to_string(),
            seccode: element.require_child_text("seccode")?.to_string(),
            client: element.child_text("client").map(str::to_string),
            side: Side::from_wire("trade", "buysell", element.require_child_text("buysell")?)?,
            time: parse_datetime("trade", "time", element.require_child_text("time")?)?,
            price: parse_decimal("trade", "price", element.require_child_text("price")?)?,
            quantity: opt_child_i64(element, "quantity")?,
            value: opt_child_decimal(element, "value")?,
            commission: opt_child_decimal(element, "comission")?,
            current_position: opt_child_i64(element, "currentpos")?,
        })
    }
}

/// One anonymous tape entry (`trade` inside `alltrades`).
#[derive(Debug, Clone, PartialEq)]
pub struct TickTrade {
    /// Session-scoped numeric security id.
    pub secid: Option<i32>,
    /// Trading board.
    pub board: String,
    /// Instrument ticker.
    pub seccode: String,
    /// Exchange trade number.
    pub trade_no: i64,
    /// Trade time.
    pub time: NaiveDateTime,
    /// Trade price.
    pub price: Decimal,
    /// Trade size in lots.
    pub quantity: i64,
    /// Aggressor side.
    pub side: Side,
    /// Open interest after the trade (futures).
    pub open_interest: Option<i64>,
}

impl TickTrade {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            secid: opt_attr_i32(element, "secid")?,
            board: element.require_child_text("board")?.to_string(),
            seccode: element.require_child_text("seccode")?.to_string(),
            trade_no: parse_i64("trade", "tradeno", element.require_child_text("tradeno")?)?,
            time: parse_datetime("trade", "time", element.require_child_text("time")?)?,
            price: parse_decimal("trade", "price", element.require_child_text("price")?)?,
            quantity: parse_i64(
                "trade",
                "quantity",
                element.require_child_text("quantity")?,
            )?,
            side: Side::from_wire("trade", "buysell", element.require_child_text("buysell")?)?,
            open_interest: opt_child_i64(element, "openinterest")?,
        })
    }
}

/// One historical bar (`candle` inside `candles`).
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    /// Bar open time.
    pub date: NaiveDateTime,
    /// Open price.
    pub open: Decimal,
    /// High price.
    pub high: Decimal,
    /// Low price.
    pub low: Decimal,
    /// Close price.
    pub close: Decimal,
    /// Volume in lots.
    pub volume: i64,
    /// Open interest at bar close (futures).
    pub open_interest: Option<i64>,
}

impl Candle {
    fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            date: parse_datetime("candle", "date", element.require_attr("date")?)?,
            open: parse_decimal("candle", "open", element.require_attr("open")?)?,
            high: parse_decimal("candle", "high", element.require_attr("high")?)?,
            low: parse_decimal("candle", "low", element.require_attr("low")?)?,
            close: parse_decimal("candle", "close", element.require_attr("close")?)?,
            volume: parse_i64("candle", "volume", element.require_attr("volume")?)?,
            open_interest: element
                .attr("oi")
                .map(|value| parse_i64("candle", "oi", value))
                .transpose()?,
        })
    }
}

/// Historical candle batch (`candles`).
#[derive(Debug, Clone, PartialEq)]
pub struct CandlePacket {
    /// Session-scoped numeric security id.
    pub secid: Option<i32>,
    /// Trading board.
    pub board: String,
    /// Instrument ticker.
    pub seccode: String,
    /// Candle period id, as registered by the connector.
    pub period: i32,
    /// Continuation marker for the originating history request.
    pub status: CandleStatus,
    /// Bars in chronological wire order.
    pub candles: Vec<Candle>,
}

impl CandlePacket {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        let status_code = parse_i32("candles", "status", element.require_attr("status")?)?;
        Ok(Self {
            secid: opt_attr_i32(element, "secid")?,
            board: element.require_attr("board")?.to_string(),
            seccode: element.require_attr("seccode")?.to_string(),
            period: parse_i32("candles", "period", element.require_attr("period")?)?,
            status: CandleStatus::from_code("candles", status_code)?,
            candles: element
                .children("candle")
                .map(Candle::from_xml)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// One market directory entry (`market` inside `markets`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Market {
    /// Market id referenced by instrument data.
    pub id: i32,
    /// Human-readable market name.
    pub name: String,
}

impl Market {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            id: parse_i32("market", "id", element.require_attr("id")?)?,
            name: element.text.clone(),
        })
    }
}

/// Client account descriptor (`client`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAccount {
    /// Account id used in order commands.
    pub id: String,
    /// False when the account was removed (`remove="true"`).
    pub active: bool,
    /// Account type (`spot`, `leverage`, `margin_level`, `mct`).
    pub account_type: Option<String>,
    /// Portfolio currency.
    pub currency: Option<String>,
    /// Market id the account trades on.
    pub market: Option<i32>,
    /// United-portfolio code the account belongs to.
    pub union: Option<String>,
    /// FORTS account code.
    pub forts_account: Option<String>,
}

impl ClientAccount {
    pub(crate) fn from_xml(element: &XmlElement) -> Result<Self, DecodeError> {
        Ok(Self {
            id: element.require_attr("id")?.to_string(),
            active: element.attr("remove") != Some("true"),
            account_type: element.child_text("type").map(str::to_string),
            currency: element.child_text("currency").map(str::to_string),
            market: opt_child_i32(element, "market")?,
            union: element.child_text("union").map(str::to_string),
            forts_account: element.child_text("forts_acc").map(str::to_string),
        })
    }
}

// =============================================================================
// Optional-field helpers
// =============================================================================

fn opt_attr_i32(element: &XmlElement, name: &str) -> Result<Option<i32>, DecodeError> {
    element
        .attr(name)
        .map(|value| parse_i32(&element.name, name, value))
        .transpose()
}

fn opt_child_i32(element: &XmlElement, name: &str) -> Result<Option<i32>, DecodeError> {
    element
        .child_text(name)
        .map(|value| parse_i32(&element.name, name, value))
        .transpose()
}

fn opt_child_i64(element: &XmlElement, name: &str) -> Result<Option<i64>, DecodeError> {
    element
        .child_text(name)
        .map(|value| parse_i64(&element.name, name, value))
        .transpose()
}

fn opt_child_decimal(element: &XmlElement, name: &str) -> Result<Option<Decimal>, DecodeError> {
    element
        .child_text(name)
        .map(|value| parse_decimal(&element.name, name, value))
        .transpose()
}

fn opt_child_datetime(
    element: &XmlElement,
    name: &str,
) -> Result<Option<NaiveDateTime>, DecodeError> {
    element
        .child_text(name)
        .map(|value| parse_datetime(&element.name, name, value))
        .transpose()
}
