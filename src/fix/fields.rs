//! FIX 4.2 tag numbers and message type codes used by the session layer.

#![allow(non_camel_case_types)]
#![allow(clippy::upper_case_acronyms)]

/// Tag numbers for the fields the session layer reads or writes, plus the
/// application-level tags that commonly appear in messages flowing through it.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tags {
    Account = 1,
    AvgPx = 6,
    BeginSeqNo = 7,
    BeginString = 8,
    BodyLength = 9,
    CheckSum = 10,
    ClOrdID = 11,
    CumQty = 14,
    EndSeqNo = 16,
    ExecID = 17,
    MsgSeqNum = 34,
    MsgType = 35,
    NewSeqNo = 36,
    OrderID = 37,
    OrderQty = 38,
    OrdStatus = 39,
    OrdType = 40,
    PossDupFlag = 43,
    Price = 44,
    RefSeqNum = 45,
    SenderCompID = 49,
    SendingTime = 52,
    Side = 54,
    Symbol = 55,
    TargetCompID = 56,
    Text = 58,
    TransactTime = 60,
    PossResend = 97,
    EncryptMethod = 98,
    HeartBtInt = 108,
    TestReqID = 112,
    OrigSendingTime = 122,
    GapFillFlag = 123,
    ResetSeqNumFlag = 141,
    RefTagID = 371,
    RefMsgType = 372,
    SessionRejectReason = 373,
    TestMessageIndicator = 464,
}

impl From<Tags> for u32 {
    fn from(t: Tags) -> u32 {
        t as u32
    }
}

/// Message type codes from `MsgType(35)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    HEARTBEAT,
    TEST_REQUEST,
    RESEND_REQUEST,
    REJECT,
    SEQUENCE_RESET,
    LOGOUT,
    INDICATION_OF_INTEREST,
    ADVERTISEMENT,
    EXECUTION_REPORT,
    ORDER_CANCEL_REJECT,
    LOGON,
    NEWS,
    EMAIL,
    ORDER_SINGLE,
    ORDER_LIST,
    ORDER_CANCEL_REQUEST,
    ORDER_CANCEL_REPLACE_REQUEST,
    ORDER_STATUS_REQUEST,
    ALLOCATION,
    LIST_CANCEL_REQUEST,
    LIST_EXECUTE,
    LIST_STATUS_REQUEST,
    LIST_STATUS,
    ALLOCATION_ACK,
    DONT_KNOW_TRADE,
    QUOTE_REQUEST,
    QUOTE,
    SETTLEMENT_INSTRUCTIONS,
    MARKET_DATA_REQUEST,
    MARKET_DATA_SNAPSHOT_FULL_REFRESH,
    MARKET_DATA_INCREMENTAL_REFRESH,
    MARKET_DATA_REQUEST_REJECT,
    QUOTE_CANCEL,
    QUOTE_STATUS_REQUEST,
    QUOTE_ACKNOWLEDGEMENT,
    SECURITY_DEFINITION_REQUEST,
    SECURITY_DEFINITION,
    SECURITY_STATUS_REQUEST,
    SECURITY_STATUS,
    TRADING_SESSION_STATUS_REQUEST,
    TRADING_SESSION_STATUS,
    MASS_QUOTE,
    BUSINESS_MESSAGE_REJECT,
    BID_REQUEST,
    BID_RESPONSE,
    LIST_STRIKE_PRICE,
}

impl MsgType {
    /// The seven administrative codes of the session layer. Everything else
    /// is an application message as far as sequencing is concerned.
    pub fn is_session(&self) -> bool {
        matches!(
            self,
            MsgType::HEARTBEAT
                | MsgType::TEST_REQUEST
                | MsgType::RESEND_REQUEST
                | MsgType::REJECT
                | MsgType::SEQUENCE_RESET
                | MsgType::LOGOUT
                | MsgType::LOGON
        )
    }

    pub fn is_application(&self) -> bool {
        !self.is_session()
    }
}

impl From<MsgType> for char {
    fn from(t: MsgType) -> char {
        let bytes: &'static [u8] = t.into();
        bytes[0] as char
    }
}

impl From<MsgType> for &'static [u8] {
    fn from(t: MsgType) -> &'static [u8] {
        match t {
            MsgType::HEARTBEAT => b"0",
            MsgType::TEST_REQUEST => b"1",
            MsgType::RESEND_REQUEST => b"2",
            MsgType::REJECT => b"3",
            MsgType::SEQUENCE_RESET => b"4",
            MsgType::LOGOUT => b"5",
            MsgType::INDICATION_OF_INTEREST => b"6",
            MsgType::ADVERTISEMENT => b"7",
            MsgType::EXECUTION_REPORT => b"8",
            MsgType::ORDER_CANCEL_REJECT => b"9",
            MsgType::LOGON => b"A",
            MsgType::NEWS => b"B",
            MsgType::EMAIL => b"C",
            MsgType::ORDER_SINGLE => b"D",
            MsgType::ORDER_LIST => b"E",
            MsgType::ORDER_CANCEL_REQUEST => b"F",
            MsgType::ORDER_CANCEL_REPLACE_REQUEST => b"G",
            MsgType::ORDER_STATUS_REQUEST => b"H",
            MsgType::ALLOCATION => b"J",
            MsgType::LIST_CANCEL_REQUEST => b"K",
            MsgType::LIST_EXECUTE => b"L",
            MsgType::LIST_STATUS_REQUEST => b"M",
            MsgType::LIST_STATUS => b"N",
            MsgType::ALLOCATION_ACK => b"P",
            MsgType::DONT_KNOW_TRADE => b"Q",
            MsgType::QUOTE_REQUEST => b"R",
            MsgType::QUOTE => b"S",
            MsgType::SETTLEMENT_INSTRUCTIONS => b"T",
            MsgType::MARKET_DATA_REQUEST => b"V",
            MsgType::MARKET_DATA_SNAPSHOT_FULL_REFRESH => b"W",
            MsgType::MARKET_DATA_INCREMENTAL_REFRESH => b"X",
            MsgType::MARKET_DATA_REQUEST_REJECT => b"Y",
            MsgType::QUOTE_CANCEL => b"Z",
            MsgType::QUOTE_STATUS_REQUEST => b"a",
            MsgType::QUOTE_ACKNOWLEDGEMENT => b"b",
            MsgType::SECURITY_DEFINITION_REQUEST => b"c",
            MsgType::SECURITY_DEFINITION => b"d",
            MsgType::SECURITY_STATUS_REQUEST => b"e",
            MsgType::SECURITY_STATUS => b"f",
            MsgType::TRADING_SESSION_STATUS_REQUEST => b"g",
            MsgType::TRADING_SESSION_STATUS => b"h",
            MsgType::MASS_QUOTE => b"i",
            MsgType::BUSINESS_MESSAGE_REJECT => b"j",
            MsgType::BID_REQUEST => b"k",
            MsgType::BID_RESPONSE => b"l",
            MsgType::LIST_STRIKE_PRICE => b"m",
        }
    }
}

impl TryFrom<&[u8]> for MsgType {
    type Error = UnknownMsgType;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        match value {
            b"0" => Ok(Self::HEARTBEAT),
            b"1" => Ok(Self::TEST_REQUEST),
            b"2" => Ok(Self::RESEND_REQUEST),
            b"3" => Ok(Self::REJECT),
            b"4" => Ok(Self::SEQUENCE_RESET),
            b"5" => Ok(Self::LOGOUT),
            b"6" => Ok(Self::INDICATION_OF_INTEREST),
            b"7" => Ok(Self::ADVERTISEMENT),
            b"8" => Ok(Self::EXECUTION_REPORT),
            b"9" => Ok(Self::ORDER_CANCEL_REJECT),
            b"A" => Ok(Self::LOGON),
            b"B" => Ok(Self::NEWS),
            b"C" => Ok(Self::EMAIL),
            b"D" => Ok(Self::ORDER_SINGLE),
            b"E" => Ok(Self::ORDER_LIST),
            b"F" => Ok(Self::ORDER_CANCEL_REQUEST),
            b"G" => Ok(Self::ORDER_CANCEL_REPLACE_REQUEST),
            b"H" => Ok(Self::ORDER_STATUS_REQUEST),
            b"J" => Ok(Self::ALLOCATION),
            b"K" => Ok(Self::LIST_CANCEL_REQUEST),
            b"L" => Ok(Self::LIST_EXECUTE),
            b"M" => Ok(Self::LIST_STATUS_REQUEST),
            b"N" => Ok(Self::LIST_STATUS),
            b"P" => Ok(Self::ALLOCATION_ACK),
            b"Q" => Ok(Self::DONT_KNOW_TRADE),
            b"R" => Ok(Self::QUOTE_REQUEST),
            b"S" => Ok(Self::QUOTE),
            b"T" => Ok(Self::SETTLEMENT_INSTRUCTIONS),
            b"V" => Ok(Self::MARKET_DATA_REQUEST),
            b"W" => Ok(Self::MARKET_DATA_SNAPSHOT_FULL_REFRESH),
            b"X" => Ok(Self::MARKET_DATA_INCREMENTAL_REFRESH),
            b"Y" => Ok(Self::MARKET_DATA_REQUEST_REJECT),
            b"Z" => Ok(Self::QUOTE_CANCEL),
            b"a" => Ok(Self::QUOTE_STATUS_REQUEST),
            b"b" => Ok(Self::QUOTE_ACKNOWLEDGEMENT),
            b"c" => Ok(Self::SECURITY_DEFINITION_REQUEST),
            b"d" => Ok(Self::SECURITY_DEFINITION),
            b"e" => Ok(Self::SECURITY_STATUS_REQUEST),
            b"f" => Ok(Self::SECURITY_STATUS),
            b"g" => Ok(Self::TRADING_SESSION_STATUS_REQUEST),
            b"h" => Ok(Self::TRADING_SESSION_STATUS),
            b"i" => Ok(Self::MASS_QUOTE),
            b"j" => Ok(Self::BUSINESS_MESSAGE_REJECT),
            b"k" => Ok(Self::BID_REQUEST),
            b"l" => Ok(Self::BID_RESPONSE),
            b"m" => Ok(Self::LIST_STRIKE_PRICE),
            other => Err(UnknownMsgType(String::from_utf8_lossy(other).into_owned())),
        }
    }
}

/// A `MsgType(35)` value outside the FIX 4.2 dictionary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown MsgType {0:?}")]
pub struct UnknownMsgType(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_codes_match_the_fix_dictionary() {
        for (code, msg_type) in [
            (&b"A"[..], MsgType::LOGON),
            (b"0", MsgType::HEARTBEAT),
            (b"1", MsgType::TEST_REQUEST),
            (b"2", MsgType::RESEND_REQUEST),
            (b"4", MsgType::SEQUENCE_RESET),
            (b"5", MsgType::LOGOUT),
            (b"3", MsgType::REJECT),
        ] {
            assert_eq!(MsgType::try_from(code), Ok(msg_type));
            assert!(msg_type.is_session());
            let round: &'static [u8] = msg_type.into();
            assert_eq!(round, code);
        }
    }

    #[test]
    fn application_types_are_not_session_types() {
        assert!(MsgType::ORDER_SINGLE.is_application());
        assert!(MsgType::EXECUTION_REPORT.is_application());
        assert!(!MsgType::EXECUTION_REPORT.is_session());
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(MsgType::try_from(&b"!"[..]).is_err());
    }
}
