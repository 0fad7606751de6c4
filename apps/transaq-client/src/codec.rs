//! XML Codec
//!
//! Decoding of raw connector payloads into [`TransaqMessage`] variants and
//! the element-tree plumbing shared with the command encoder.
//!
//! The connector delivers one XML document per frame, discriminated by its
//! root tag. Decoding is table-driven: the root tag selects a typed decoder,
//! unknown tags fail with [`DecodeError::UnknownRootName`], shape violations
//! with [`DecodeError::MalformedField`]. Decoding is total — malformed input
//! yields a typed error, never a panic, so the dispatch engine can decide
//! recovery.
//!
//! # Wire Format
//!
//! ```xml
//! <server_status connected="true" server_tz="Europe/Moscow"/>
//! <quotations><quotation secid="21"><board>TQBR</board>…</quotation></quotations>
//! <error>invalid login</error>
//! ```

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use crate::messages::{
    CandlePacket, ClientAccount, CommandResult, Market, Order, OwnTrade, Quotation, SecurityInfo,
    ServerError, ServerStatus, TickTrade, TransaqMessage,
};
use crate::transport::RawPayload;

/// Timestamp format used throughout the connector protocol.
pub const TRANSAQ_DATETIME_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Timestamp format with millisecond precision (connector `milliseconds` mode).
pub const TRANSAQ_DATETIME_MS_FORMAT: &str = "%d.%m.%Y %H:%M:%S%.3f";

/// Decoding failures.
///
/// Recovered locally by the dispatch engine: the offending payload is
/// dropped and reported, the stream continues.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// The payload is not well-formed XML.
    #[error("invalid XML payload: {0}")]
    InvalidXml(String),

    /// The root tag matches no known message kind.
    #[error("unknown root element <{0}>")]
    UnknownRootName(String),

    /// A required field is absent or has the wrong shape.
    #[error("malformed field `{field}` in <{element}>: {reason}")]
    MalformedField {
        /// Root or entry element the field belongs to.
        element: String,
        /// Attribute or child element name.
        field: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(
        element: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::MalformedField {
            element: element.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Decode one raw payload into its typed message variant.
///
/// # Errors
///
/// Returns [`DecodeError`] for non-XML input, unknown root tags, and
/// missing or malformed required fields.
pub fn decode(raw: &RawPayload) -> Result<TransaqMessage, DecodeError> {
    let root = XmlElement::parse(raw)?;

    // Root-tag dispatch table. New message kinds are added here, not by
    // runtime type inspection.
    match root.name.as_str() {
        "server_status" => Ok(ServerStatus::from_xml(&root)?.into_message()),
        "result" => Ok(TransaqMessage::CommandResult(CommandResult::from_xml(
            &root,
        )?)),
        "error" => Ok(TransaqMessage::ServerError(ServerError::from_xml(&root)?)),
        "sec_info" => Ok(TransaqMessage::SecurityInfo(SecurityInfo::from_xml(&root)?)),
        "quotations" => Ok(TransaqMessage::Quotes(
            root.children("quotation")
                .map(Quotation::from_xml)
                .collect::<Result<_, _>>()?,
        )),
        "orders" => Ok(TransaqMessage::OrderStatus(
            root.children("order")
                .map(Order::from_xml)
                .collect::<Result<_, _>>()?,
        )),
        "trades" => Ok(TransaqMessage::Trades(
            root.children("trade")
                .map(OwnTrade::from_xml)
                .collect::<Result<_, _>>()?,
        )),
        "alltrades" => Ok(TransaqMessage::AllTrades(
            root.children("trade")
                .map(TickTrade::from_xml)
                .collect::<Result<_, _>>()?,
        )),
        "candles" => Ok(TransaqMessage::Candles(CandlePacket::from_xml(&root)?)),
        "markets" => Ok(TransaqMessage::Markets(
            root.children("market")
                .map(Market::from_xml)
                .collect::<Result<_, _>>()?,
        )),
        "client" => Ok(TransaqMessage::ClientAccount(ClientAccount::from_xml(
            &root,
        )?)),
        other => Err(DecodeError::UnknownRootName(other.to_string())),
    }
}

// =============================================================================
// Element Tree
// =============================================================================

/// Parsed XML element: tag name, attributes, text content, child elements.
///
/// Small enough to build eagerly — connector frames are single messages,
/// not documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse a payload into its root element.
    pub fn parse(xml: &str) -> Result<Self, DecodeError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let invalid = |e: &dyn std::fmt::Display| DecodeError::InvalidXml(e.to_string());

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event().map_err(|e| invalid(&e))? {
                Event::Start(start) => {
                    stack.push(Self::from_start(&start)?);
                }
                Event::Empty(start) => {
                    let element = Self::from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {
                            return Err(DecodeError::InvalidXml(
                                "multiple root elements".to_string(),
                            ));
                        }
                    }
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current
                            .text
                            .push_str(&text.unescape().map_err(|e| invalid(&e))?);
                    }
                }
                Event::End(_) => {
                    let Some(element) = stack.pop() else {
                        return Err(DecodeError::InvalidXml("unbalanced end tag".to_string()));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => {
                            return Err(DecodeError::InvalidXml(
                                "multiple root elements".to_string(),
                            ));
                        }
                    }
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions.
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(DecodeError::InvalidXml("unclosed element".to_string()));
        }
        root.ok_or_else(|| DecodeError::InvalidXml("empty document".to_string()))
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Self, DecodeError> {
        let mut element = Self::new(String::from_utf8_lossy(start.name().as_ref()).into_owned());
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| DecodeError::InvalidXml(e.to_string()))?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| DecodeError::InvalidXml(e.to_string()))?
                .into_owned();
            element.attributes.push((key, value));
        }
        Ok(element)
    }

    /// Serialize this element (and its subtree) to an XML string.
    pub fn to_xml(&self) -> Result<String, XmlWriteError> {
        let mut writer = Writer::new(Vec::new());
        self.write_into(&mut writer)?;
        String::from_utf8(writer.into_inner()).map_err(|e| XmlWriteError(e.to_string()))
    }

    fn write_into(&self, writer: &mut Writer<Vec<u8>>) -> Result<(), XmlWriteError> {
        let mut start = BytesStart::new(self.name.as_str());
        for (key, value) in &self.attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        let write = |e: &dyn std::fmt::Display| XmlWriteError(e.to_string());

        if self.text.is_empty() && self.children.is_empty() {
            writer
                .write_event(Event::Empty(start))
                .map_err(|e| write(&e))?;
            return Ok(());
        }

        writer
            .write_event(Event::Start(start))
            .map_err(|e| write(&e))?;
        if !self.text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(&self.text)))
                .map_err(|e| write(&e))?;
        }
        for child in &self.children {
            child.write_into(writer)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| write(&e))?;
        Ok(())
    }

    // ---- builder helpers (used by the command encoder) ----

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn with_text_child(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut child = Self::new(name);
        child.text = text.into();
        self.children.push(child);
        self
    }

    pub fn with_flag_child(mut self, name: impl Into<String>) -> Self {
        self.children.push(Self::new(name));
        self
    }

    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    // ---- field accessors (used by message decoders) ----

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn require_attr(&self, name: &str) -> Result<&str, DecodeError> {
        self.attr(name)
            .ok_or_else(|| DecodeError::malformed(&self.name, name, "missing attribute"))
    }

    pub fn child(&self, name: &str) -> Option<&Self> {
        self.children.iter().find(|child| child.name == name)
    }

    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Self> {
        self.children.iter().filter(move |child| child.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|child| child.text.as_str())
            .filter(|text| !text.is_empty())
    }

    pub fn require_child_text(&self, name: &str) -> Result<&str, DecodeError> {
        self.child_text(name)
            .ok_or_else(|| DecodeError::malformed(&self.name, name, "missing element"))
    }
}

/// XML serialization failure. Practically unreachable when writing to a
/// buffer; surfaced so the encoder never panics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("XML write error: {0}")]
pub struct XmlWriteError(pub(crate) String);

// =============================================================================
// Typed field parsing
// =============================================================================

pub(crate) fn parse_decimal(
    element: &str,
    field: &str,
    value: &str,
) -> Result<rust_decimal::Decimal, DecodeError> {
    value
        .parse()
        .map_err(|_| DecodeError::malformed(element, field, format!("not a decimal: `{value}`")))
}

pub(crate) fn parse_i64(element: &str, field: &str, value: &str) -> Result<i64, DecodeError> {
    value
        .parse()
        .map_err(|_| DecodeError::malformed(element, field, format!("not an integer: `{value}`")))
}

pub(crate) fn parse_i32(element: &str, field: &str, value: &str) -> Result<i32, DecodeError> {
    value
        .parse()
        .map_err(|_| DecodeError::malformed(element, field, format!("not an integer: `{value}`")))
}

/// Parse a connector timestamp, with or without millisecond precision.
pub(crate) fn parse_datetime(
    element: &str,
    field: &str,
    value: &str,
) -> Result<chrono::NaiveDateTime, DecodeError> {
    chrono::NaiveDateTime::parse_from_str(value, TRANSAQ_DATETIME_FORMAT)
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value, TRANSAQ_DATETIME_MS_FORMAT))
        .map_err(|_| DecodeError::malformed(element, field, format!("not a timestamp: `{value}`")))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::messages::{ConnectorStatus, Side};

    #[test]
    fn parse_empty_element_with_attributes() {
        let element = XmlElement::parse(r#"<server_status connected="true" recover="true"/>"#)
            .expect("well-formed");
        assert_eq!(element.name, "server_status");
        assert_eq!(element.attr("connected"), Some("true"));
        assert_eq!(element.attr("recover"), Some("true"));
        assert!(element.children.is_empty());
    }

    #[test]
    fn parse_nested_children_and_text() {
        let element = XmlElement::parse(
            "<sec_info secid=\"42\"><board>TQBR</board><seccode>GAZP</seccode></sec_info>",
        )
        .expect("well-formed");
        assert_eq!(element.child_text("board"), Some("TQBR"));
        assert_eq!(element.child_text("seccode"), Some("GAZP"));
        assert_eq!(element.attr("secid"), Some("42"));
    }

    #[test]
    fn parse_unescapes_entities() {
        let element = XmlElement::parse("<error>login &amp; password rejected</error>")
            .expect("well-formed");
        assert_eq!(element.text, "login & password rejected");
    }

    #[test]
    fn element_roundtrip() {
        let element = XmlElement::new("command")
            .with_attribute("id", "subscribe")
            .with_child(
                XmlElement::new("quotations").with_child(
                    XmlElement::new("security")
                        .with_text_child("board", "TQBR")
                        .with_text_child("seccode", "GAZP"),
                ),
            );
        let xml = element.to_xml().expect("writable");
        assert_eq!(
            xml,
            "<command id=\"subscribe\"><quotations><security><board>TQBR</board>\
             <seccode>GAZP</seccode></security></quotations></command>"
        );
        assert_eq!(XmlElement::parse(&xml).expect("reparses"), element);
    }

    #[test]
    fn decode_connect_ack() {
        let raw = r#"<server_status connected="true" server_tz="Europe/Moscow"/>"#.to_string();
        match decode(&raw).expect("decodes") {
            TransaqMessage::ConnectAck(status) => {
                assert_eq!(status.status, ConnectorStatus::Connected);
                assert_eq!(status.timezone.as_deref(), Some("Europe/Moscow"));
                assert!(!status.recovering);
            }
            other => panic!("expected ConnectAck, got {other:?}"),
        }
    }

    #[test]
    fn decode_disconnect_notice_with_error_text() {
        let raw = r#"<server_status connected="error">wrong password</server_status>"#.to_string();
        match decode(&raw).expect("decodes") {
            TransaqMessage::DisconnectNotice(status) => {
                assert_eq!(status.status, ConnectorStatus::Error);
                assert_eq!(status.error_text(), Some("wrong password"));
            }
            other => panic!("expected DisconnectNotice, got {other:?}"),
        }
    }

    #[test]
    fn decode_quotations_packet_preserves_entry_order() {
        let raw = "<quotations>\
             <quotation secid=\"1\"><board>TQBR</board><seccode>GAZP</seccode>\
             <bid>161.50</bid><offer>161.56</offer><last>161.52</last></quotation>\
             <quotation secid=\"2\"><board>TQBR</board><seccode>SBER</seccode>\
             <last>281.10</last></quotation>\
             </quotations>"
            .to_string();
        match decode(&raw).expect("decodes") {
            TransaqMessage::Quotes(quotes) => {
                assert_eq!(quotes.len(), 2);
                assert_eq!(quotes[0].seccode, "GAZP");
                assert_eq!(quotes[0].best_bid, Some("161.50".parse().expect("decimal")));
                assert_eq!(quotes[1].seccode, "SBER");
                assert_eq!(quotes[1].best_bid, None);
            }
            other => panic!("expected Quotes, got {other:?}"),
        }
    }

    #[test]
    fn decode_orders_packet() {
        let raw = "<orders><order transactionid=\"17\"><orderno>4581\
             </orderno><board>TQBR</board><seccode>GAZP</seccode><client>C1</client>\
             <status>active</status><buysell>B</buysell><price>161.40</price>\
             <quantity>10</quantity><balance>10</balance>\
             <time>02.06.2025 12:00:01</time></order></orders>"
            .to_string();
        match decode(&raw).expect("decodes") {
            TransaqMessage::OrderStatus(orders) => {
                assert_eq!(orders.len(), 1);
                assert_eq!(orders[0].transaction_id, 17);
                assert_eq!(orders[0].side, Side::Buy);
                assert_eq!(orders[0].quantity, Some(10));
            }
            other => panic!("expected OrderStatus, got {other:?}"),
        }
    }

    #[test]
    fn decode_candles_packet() {
        let raw = "<candles secid=\"3\" board=\"TQBR\" seccode=\"GAZP\" period=\"2\" status=\"1\">\
             <candle date=\"02.06.2025 10:00:00\" open=\"160.0\" high=\"161.2\" low=\"159.9\" \
             close=\"161.0\" volume=\"1200\"/></candles>"
            .to_string();
        match decode(&raw).expect("decodes") {
            TransaqMessage::Candles(packet) => {
                assert_eq!(packet.seccode, "GAZP");
                assert_eq!(packet.candles.len(), 1);
                assert_eq!(packet.candles[0].volume, 1200);
            }
            other => panic!("expected Candles, got {other:?}"),
        }
    }

    #[test]
    fn decode_unknown_root_is_typed_error() {
        let raw = "<positions><money_position/></positions>".to_string();
        match decode(&raw) {
            Err(DecodeError::UnknownRootName(name)) => assert_eq!(name, "positions"),
            other => panic!("expected UnknownRootName, got {other:?}"),
        }
    }

    // Malformed payloads must yield typed errors, never panic.
    #[test_case("<sec_info><seccode>GAZP</seccode></sec_info>" ; "missing required board")]
    #[test_case("<server_status/>" ; "missing connected attribute")]
    #[test_case("<orders><order><board>TQBR</board></order></orders>" ; "order without transaction id")]
    #[test_case("<candles board=\"TQBR\" seccode=\"GAZP\" period=\"x\" status=\"1\"/>" ; "non numeric period")]
    #[test_case("<quotations><quotation><board>TQBR</board><seccode>GAZP</seccode><bid>n/a</bid></quotation></quotations>" ; "non numeric bid")]
    fn decode_malformed_field(raw: &str) {
        match decode(&raw.to_string()) {
            Err(DecodeError::MalformedField { .. }) => {}
            other => panic!("expected MalformedField, got {other:?}"),
        }
    }

    #[test_case("" ; "empty input")]
    #[test_case("not xml at all" ; "plain text")]
    #[test_case("<open><unclosed></open>" ; "mismatched tags")]
    fn decode_invalid_xml(raw: &str) {
        match decode(&raw.to_string()) {
            Err(DecodeError::InvalidXml(_)) => {}
            other => panic!("expected InvalidXml, got {other:?}"),
        }
    }

    #[test]
    fn datetime_accepts_millisecond_precision() {
        let plain = parse_datetime("trade", "time", "02.06.2025 12:00:01").expect("parses");
        assert_eq!(plain.format("%H:%M:%S").to_string(), "12:00:01");
        parse_datetime("trade", "time", "02.06.2025 12:00:01.250").expect("parses with millis");
        parse_datetime("trade", "time", "yesterday").expect_err("rejects junk");
    }
}
