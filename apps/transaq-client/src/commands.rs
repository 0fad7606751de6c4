//! Command Encoder
//!
//! Typed outgoing commands and their XML encoding. Construction validates,
//! encoding never fails for a constructed value in practice; both are pure
//! and perform no I/O. The session engine owns delivery.
//!
//! # Wire Format
//!
//! ```xml
//! <command id="subscribe"><quotations>
//!   <security><board>TQBR</board><seccode>GAZP</seccode></security>
//! </quotations></command>
//! <command id="cancelorder"><transactionid>17</transactionid></command>
//! ```

use rust_decimal::Decimal;

use crate::codec::{XmlElement, XmlWriteError};
use crate::config::ConnectParams;
use crate::messages::Side;
use crate::transport::EncodedPayload;

/// Command construction or serialization failure. Always synchronous,
/// always before any transport I/O.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EncodeError {
    /// A parameter failed validation.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Parameter name as the caller knows it.
        name: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// XML serialization failed.
    #[error(transparent)]
    Xml(#[from] XmlWriteError),
}

impl EncodeError {
    fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

fn require_nonempty(name: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.trim().is_empty() {
        return Err(EncodeError::invalid(name, "must not be empty"));
    }
    Ok(())
}

/// Instrument key: trading board plus ticker. Non-empty by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Security {
    board: String,
    seccode: String,
}

impl Security {
    /// Build a validated instrument key.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] when either part is empty.
    pub fn new(board: impl Into<String>, seccode: impl Into<String>) -> Result<Self, EncodeError> {
        let board = board.into();
        let seccode = seccode.into();
        require_nonempty("board", &board)?;
        require_nonempty("seccode", &seccode)?;
        Ok(Self { board, seccode })
    }

    /// Trading board identifier.
    #[must_use]
    pub fn board(&self) -> &str {
        &self.board
    }

    /// Instrument ticker.
    #[must_use]
    pub fn seccode(&self) -> &str {
        &self.seccode
    }

    fn to_element(&self) -> XmlElement {
        XmlElement::new("security")
            .with_text_child("board", &self.board)
            .with_text_child("seccode", &self.seccode)
    }
}

/// What the exchange should do with the unfilled remainder of an order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnfilledPolicy {
    /// Leave the remainder in the book.
    #[default]
    PutInQueue,
    /// Fill completely or cancel (`FOK`).
    FillOrKill,
    /// Fill what is immediately possible, cancel the rest (`IOC`).
    ImmediateOrCancel,
}

impl UnfilledPolicy {
    const fn as_wire(self) -> &'static str {
        match self {
            Self::PutInQueue => "PutInQueue",
            Self::FillOrKill => "FOK",
            Self::ImmediateOrCancel => "IOC",
        }
    }
}

/// Validated parameters for a new order.
///
/// Defaults to a market order (`<bymarket/>`); [`OrderParams::limit`]
/// turns it into a limit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderParams {
    security: Security,
    client: String,
    side: Side,
    quantity: i64,
    price: Option<Decimal>,
    unfilled: UnfilledPolicy,
    use_credit: bool,
}

impl OrderParams {
    /// Build market-order parameters.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for an empty client id or
    /// a non-positive quantity.
    pub fn new(
        security: Security,
        client: impl Into<String>,
        side: Side,
        quantity: i64,
    ) -> Result<Self, EncodeError> {
        let client = client.into();
        require_nonempty("client", &client)?;
        if quantity <= 0 {
            return Err(EncodeError::invalid(
                "quantity",
                format!("must be positive, got {quantity}"),
            ));
        }
        Ok(Self {
            security,
            client,
            side,
            quantity,
            price: None,
            unfilled: UnfilledPolicy::default(),
            use_credit: false,
        })
    }

    /// Make this a limit order at `price`.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for a non-positive price.
    pub fn limit(mut self, price: Decimal) -> Result<Self, EncodeError> {
        if price <= Decimal::ZERO {
            return Err(EncodeError::invalid(
                "price",
                format!("must be positive, got {price}"),
            ));
        }
        self.price = Some(price);
        Ok(self)
    }

    /// Set the unfilled-remainder policy.
    #[must_use]
    pub const fn unfilled(mut self, policy: UnfilledPolicy) -> Self {
        self.unfilled = policy;
        self
    }

    /// Allow the broker to extend credit for this order.
    #[must_use]
    pub const fn use_credit(mut self) -> Self {
        self.use_credit = true;
        self
    }
}

/// One outgoing connector command.
///
/// Values are immutable and constructed only through the validating
/// constructors below.
#[derive(Debug, Clone)]
pub enum Command {
    /// Open the broker session.
    Connect(ConnectParams),
    /// Close the broker session.
    Disconnect,
    /// Ask for the current `server_status`.
    ServerStatus,
    /// Start quotation updates for a set of instruments.
    SubscribeQuotes {
        /// Instruments to subscribe.
        securities: Vec<Security>,
    },
    /// Stop quotation updates for a set of instruments.
    UnsubscribeQuotes {
        /// Instruments to unsubscribe.
        securities: Vec<Security>,
    },
    /// Start anonymous-tape updates for a set of instruments.
    SubscribeAllTrades {
        /// Instruments to subscribe.
        securities: Vec<Security>,
    },
    /// Stop anonymous-tape updates for a set of instruments.
    UnsubscribeAllTrades {
        /// Instruments to unsubscribe.
        securities: Vec<Security>,
    },
    /// Request instrument reference data (answered by `sec_info`).
    GetSecurityInfo {
        /// Instrument to look up.
        security: Security,
    },
    /// Place an order.
    NewOrder(OrderParams),
    /// Cancel an order by its connector transaction id.
    CancelOrder {
        /// Transaction id from the order's `result` or `order` message.
        transaction_id: i64,
    },
    /// Request the last `count` candles of `period` for an instrument.
    GetHistoryData {
        /// Instrument to fetch history for.
        security: Security,
        /// Connector candle-period id.
        period: i32,
        /// Number of candles requested.
        count: u32,
        /// Fetch the freshest data instead of continuing a prior request.
        reset: bool,
    },
    /// Change the broker account password.
    ChangePassword {
        /// Current password.
        old: String,
        /// Replacement password.
        new: String,
    },
}

fn require_securities(securities: &[Security]) -> Result<(), EncodeError> {
    if securities.is_empty() {
        return Err(EncodeError::invalid(
            "securities",
            "at least one instrument is required",
        ));
    }
    Ok(())
}

impl Command {
    /// Subscribe to quotation updates.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for an empty instrument list.
    pub fn subscribe_quotes(securities: Vec<Security>) -> Result<Self, EncodeError> {
        require_securities(&securities)?;
        Ok(Self::SubscribeQuotes { securities })
    }

    /// Unsubscribe from quotation updates.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for an empty instrument list.
    pub fn unsubscribe_quotes(securities: Vec<Security>) -> Result<Self, EncodeError> {
        require_securities(&securities)?;
        Ok(Self::UnsubscribeQuotes { securities })
    }

    /// Subscribe to the anonymous trade tape.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for an empty instrument list.
    pub fn subscribe_all_trades(securities: Vec<Security>) -> Result<Self, EncodeError> {
        require_securities(&securities)?;
        Ok(Self::SubscribeAllTrades { securities })
    }

    /// Unsubscribe from the anonymous trade tape.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for an empty instrument list.
    pub fn unsubscribe_all_trades(securities: Vec<Security>) -> Result<Self, EncodeError> {
        require_securities(&securities)?;
        Ok(Self::UnsubscribeAllTrades { securities })
    }

    /// Cancel an order.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for a non-positive id.
    pub fn cancel_order(transaction_id: i64) -> Result<Self, EncodeError> {
        if transaction_id <= 0 {
            return Err(EncodeError::invalid(
                "transaction_id",
                format!("must be positive, got {transaction_id}"),
            ));
        }
        Ok(Self::CancelOrder { transaction_id })
    }

    /// Request candle history.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] for a non-positive period
    /// or a zero count.
    pub fn get_history_data(
        security: Security,
        period: i32,
        count: u32,
        reset: bool,
    ) -> Result<Self, EncodeError> {
        if period <= 0 {
            return Err(EncodeError::invalid(
                "period",
                format!("must be positive, got {period}"),
            ));
        }
        if count == 0 {
            return Err(EncodeError::invalid("count", "must be positive"));
        }
        Ok(Self::GetHistoryData {
            security,
            period,
            count,
            reset,
        })
    }

    /// Change the account password.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::InvalidParameter`] when either password is empty.
    pub fn change_password(
        old: impl Into<String>,
        new: impl Into<String>,
    ) -> Result<Self, EncodeError> {
        let old = old.into();
        let new = new.into();
        require_nonempty("old", &old)?;
        require_nonempty("new", &new)?;
        Ok(Self::ChangePassword { old, new })
    }

    /// Wire command id, the `id` attribute of the outgoing element.
    #[must_use]
    pub const fn id(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Disconnect => "disconnect",
            Self::ServerStatus => "server_status",
            Self::SubscribeQuotes { .. } | Self::SubscribeAllTrades { .. } => "subscribe",
            Self::UnsubscribeQuotes { .. } | Self::UnsubscribeAllTrades { .. } => "unsubscribe",
            Self::GetSecurityInfo { .. } => "get_securities_info",
            Self::NewOrder(_) => "neworder",
            Self::CancelOrder { .. } => "cancelorder",
            Self::GetHistoryData { .. } => "gethistorydata",
            Self::ChangePassword { .. } => "change_pass",
        }
    }

    /// Serialize to the connector's command XML.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Xml`] when serialization fails.
    pub fn encode(&self) -> Result<EncodedPayload, EncodeError> {
        let mut root = XmlElement::new("command").with_attribute("id", self.id());

        match self {
            Self::Connect(params) => {
                root = params.fill_connect_command(root);
            }
            Self::Disconnect | Self::ServerStatus => {}
            Self::SubscribeQuotes { securities } | Self::UnsubscribeQuotes { securities } => {
                root = root.with_child(subscription_group("quotations", securities));
            }
            Self::SubscribeAllTrades { securities }
            | Self::UnsubscribeAllTrades { securities } => {
                root = root.with_child(subscription_group("alltrades", securities));
            }
            Self::GetSecurityInfo { security } => {
                root = root.with_child(security.to_element());
            }
            Self::NewOrder(params) => {
                root = root
                    .with_child(params.security.to_element())
                    .with_text_child("client", &params.client)
                    .with_text_child("buysell", params.side.as_wire())
                    .with_text_child("quantity", params.quantity.to_string())
                    .with_text_child("unfilled", params.unfilled.as_wire());
                root = match params.price {
                    Some(price) => root.with_text_child("price", price.to_string()),
                    None => root.with_flag_child("bymarket"),
                };
                if params.use_credit {
                    root = root.with_flag_child("usecredit");
                }
            }
            Self::CancelOrder { transaction_id } => {
                root = root.with_text_child("transactionid", transaction_id.to_string());
            }
            Self::GetHistoryData {
                security,
                period,
                count,
                reset,
            } => {
                root = root
                    .with_child(security.to_element())
                    .with_text_child("period", period.to_string())
                    .with_text_child("count", count.to_string())
                    .with_text_child("reset", reset.to_string());
            }
            Self::ChangePassword { old, new } => {
                root = root
                    .with_attribute("oldpass", old)
                    .with_attribute("newpass", new);
            }
        }

        Ok(root.to_xml()?)
    }
}

fn subscription_group(kind: &str, securities: &[Security]) -> XmlElement {
    let mut group = XmlElement::new(kind);
    for security in securities {
        group = group.with_child(security.to_element());
    }
    group
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn gazp() -> Security {
        Security::new("TQBR", "GAZP").expect("valid")
    }

    #[test]
    fn subscribe_quotes_wraps_securities() {
        let command = Command::subscribe_quotes(vec![gazp()]).expect("valid");
        assert_eq!(
            command.encode().expect("encodes"),
            "<command id=\"subscribe\"><quotations><security><board>TQBR</board>\
             <seccode>GAZP</seccode></security></quotations></command>"
        );
    }

    #[test]
    fn unsubscribe_all_trades_uses_alltrades_group() {
        let command = Command::unsubscribe_all_trades(vec![gazp()]).expect("valid");
        let xml = command.encode().expect("encodes");
        assert!(xml.starts_with("<command id=\"unsubscribe\"><alltrades>"));
    }

    #[test]
    fn get_security_info_carries_bare_security() {
        let command = Command::GetSecurityInfo { security: gazp() };
        assert_eq!(
            command.encode().expect("encodes"),
            "<command id=\"get_securities_info\"><security><board>TQBR</board>\
             <seccode>GAZP</seccode></security></command>"
        );
    }

    #[test]
    fn market_order_emits_bymarket_flag() {
        let params =
            OrderParams::new(gazp(), "C1", Side::Buy, 10).expect("valid");
        let xml = Command::NewOrder(params).encode().expect("encodes");
        assert!(xml.contains("<bymarket/>"));
        assert!(!xml.contains("<price>"));
        assert!(xml.contains("<unfilled>PutInQueue</unfilled>"));
    }

    #[test]
    fn limit_order_emits_price_instead_of_bymarket() {
        let params = OrderParams::new(gazp(), "C1", Side::Sell, 5)
            .expect("valid")
            .limit("161.44".parse().expect("decimal"))
            .expect("positive")
            .unfilled(UnfilledPolicy::ImmediateOrCancel)
            .use_credit();
        let xml = Command::NewOrder(params).encode().expect("encodes");
        assert!(xml.contains("<buysell>S</buysell>"));
        assert!(xml.contains("<price>161.44</price>"));
        assert!(xml.contains("<unfilled>IOC</unfilled>"));
        assert!(xml.contains("<usecredit/>"));
        assert!(!xml.contains("<bymarket/>"));
    }

    #[test]
    fn cancel_order_encoding() {
        let command = Command::cancel_order(17).expect("valid");
        assert_eq!(
            command.encode().expect("encodes"),
            "<command id=\"cancelorder\"><transactionid>17</transactionid></command>"
        );
    }

    #[test]
    fn change_password_uses_attributes() {
        let command = Command::change_password("old-secret", "new-secret").expect("valid");
        assert_eq!(
            command.encode().expect("encodes"),
            "<command id=\"change_pass\" oldpass=\"old-secret\" newpass=\"new-secret\"/>"
        );
    }

    #[test]
    fn history_request_encoding() {
        let command = Command::get_history_data(gazp(), 2, 100, true).expect("valid");
        let xml = command.encode().expect("encodes");
        assert!(xml.starts_with("<command id=\"gethistorydata\">"));
        assert!(xml.contains("<period>2</period>"));
        assert!(xml.contains("<count>100</count>"));
        assert!(xml.contains("<reset>true</reset>"));
    }

    #[test_case("", "GAZP" ; "empty board")]
    #[test_case("TQBR", "" ; "empty seccode")]
    #[test_case("  ", "GAZP" ; "whitespace board")]
    fn security_rejects_blank_parts(board: &str, seccode: &str) {
        assert!(matches!(
            Security::new(board, seccode),
            Err(EncodeError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn order_params_reject_bad_values() {
        assert!(OrderParams::new(gazp(), "", Side::Buy, 1).is_err());
        assert!(OrderParams::new(gazp(), "C1", Side::Buy, 0).is_err());
        assert!(
            OrderParams::new(gazp(), "C1", Side::Buy, 1)
                .expect("valid")
                .limit(Decimal::ZERO)
                .is_err()
        );
    }

    #[test]
    fn list_and_range_validation() {
        assert!(Command::subscribe_quotes(Vec::new()).is_err());
        assert!(Command::cancel_order(0).is_err());
        assert!(Command::get_history_data(gazp(), 0, 10, true).is_err());
        assert!(Command::get_history_data(gazp(), 1, 0, true).is_err());
        assert!(Command::change_password("", "x").is_err());
    }
}
