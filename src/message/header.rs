use crate::error::FormatError;

/// Protocol version carried in every header.
pub const VERSION: u8 = 1;

/// Size of the fixed header on the wire.
pub const HEADER_LEN: usize = 4;

/// The fixed header as it appears on the wire.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRaw {
    pub ver_type_tkl: u8,
    pub code: u8,
    pub message_id: u16,
}

impl HeaderRaw {
    pub fn from_bytes(buf: &[u8]) -> Result<HeaderRaw, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::HeaderTooShort(buf.len()));
        }
        Ok(HeaderRaw {
            ver_type_tkl: buf[0],
            code: buf[1],
            message_id: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.ver_type_tkl);
        buf.push(self.code);
        buf.extend_from_slice(&self.message_id.to_be_bytes());
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.ver_type_tkl >> 6
    }

    #[inline]
    pub fn type_bits(&self) -> u8 {
        (0x30 & self.ver_type_tkl) >> 4
    }

    #[inline]
    pub fn token_length(&self) -> u8 {
        0x0F & self.ver_type_tkl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    message_type: MessageType,
    pub code: MessageClass,
    pub message_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Empty,
    Request(RequestType),
    Response(ResponseType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Get,
    Post,
    Put,
    Delete,
    UnKnown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseType {
    // 200 Codes
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    Continue,

    // 400 Codes
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestEntityIncomplete,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,

    // 500 Codes
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,

    UnKnown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> MessageType {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

impl Default for Header {
    fn default() -> Self {
        Header::new()
    }
}

impl Header {
    pub fn new() -> Header {
        Header {
            message_type: MessageType::Confirmable,
            code: MessageClass::Empty,
            message_id: 0,
        }
    }

    /// Builds a header from its raw form. Reserved code classes are
    /// rejected here so the rest of the stack never sees them.
    pub fn from_raw(raw: &HeaderRaw) -> Result<Header, FormatError> {
        if raw.version() != VERSION {
            return Err(FormatError::InvalidVersion(raw.version()));
        }
        let code = code_to_class(raw.code).ok_or(FormatError::ReservedCode(raw.code))?;
        Ok(Header {
            message_type: MessageType::from_bits(raw.type_bits()),
            code,
            message_id: raw.message_id,
        })
    }

    pub fn to_raw(&self, token_length: u8) -> HeaderRaw {
        HeaderRaw {
            ver_type_tkl: VERSION << 6 | self.message_type.to_bits() << 4 | (token_length & 0x0F),
            code: class_to_code(&self.code),
            message_id: self.message_id,
        }
    }

    #[inline]
    pub fn set_type(&mut self, t: MessageType) {
        self.message_type = t;
    }

    #[inline]
    pub fn get_type(&self) -> MessageType {
        self.message_type
    }

    /// Sets the code from its dotted form, e.g. `"2.05"`. Returns false
    /// and leaves the code untouched when the string is not a valid code.
    pub fn set_code(&mut self, code: &str) -> bool {
        match code_from_str(code).and_then(code_to_class) {
            Some(class) => {
                self.code = class;
                true
            }
            None => false,
        }
    }

    pub fn get_code(&self) -> String {
        class_to_str(&self.code)
    }

    #[inline]
    pub fn set_message_id(&mut self, message_id: u16) {
        self.message_id = message_id;
    }

    #[inline]
    pub fn get_message_id(&self) -> u16 {
        self.message_id
    }
}

pub fn class_to_code(class: &MessageClass) -> u8 {
    match *class {
        MessageClass::Empty => 0x00,

        MessageClass::Request(RequestType::Get) => 0x01,
        MessageClass::Request(RequestType::Post) => 0x02,
        MessageClass::Request(RequestType::Put) => 0x03,
        MessageClass::Request(RequestType::Delete) => 0x04,
        MessageClass::Request(RequestType::UnKnown(code)) => code,

        MessageClass::Response(ResponseType::Created) => 0x41,
        MessageClass::Response(ResponseType::Deleted) => 0x42,
        MessageClass::Response(ResponseType::Valid) => 0x43,
        MessageClass::Response(ResponseType::Changed) => 0x44,
        MessageClass::Response(ResponseType::Content) => 0x45,
        MessageClass::Response(ResponseType::Continue) => 0x5F,

        MessageClass::Response(ResponseType::BadRequest) => 0x80,
        MessageClass::Response(ResponseType::Unauthorized) => 0x81,
        MessageClass::Response(ResponseType::BadOption) => 0x82,
        MessageClass::Response(ResponseType::Forbidden) => 0x83,
        MessageClass::Response(ResponseType::NotFound) => 0x84,
        MessageClass::Response(ResponseType::MethodNotAllowed) => 0x85,
        MessageClass::Response(ResponseType::NotAcceptable) => 0x86,
        MessageClass::Response(ResponseType::RequestEntityIncomplete) => 0x88,
        MessageClass::Response(ResponseType::PreconditionFailed) => 0x8C,
        MessageClass::Response(ResponseType::RequestEntityTooLarge) => 0x8D,
        MessageClass::Response(ResponseType::UnsupportedContentFormat) => 0x8F,

        MessageClass::Response(ResponseType::InternalServerError) => 0x90,
        MessageClass::Response(ResponseType::NotImplemented) => 0x91,
        MessageClass::Response(ResponseType::BadGateway) => 0x92,
        MessageClass::Response(ResponseType::ServiceUnavailable) => 0x93,
        MessageClass::Response(ResponseType::GatewayTimeout) => 0x94,
        MessageClass::Response(ResponseType::ProxyingNotSupported) => 0x95,

        MessageClass::Response(ResponseType::UnKnown(code)) => code,
    }
}

/// Maps a wire code to its class. `None` for the reserved ranges
/// (32..=63 and 192..=255).
pub fn code_to_class(code: u8) -> Option<MessageClass> {
    let class = match code {
        0x00 => MessageClass::Empty,

        0x01 => MessageClass::Request(RequestType::Get),
        0x02 => MessageClass::Request(RequestType::Post),
        0x03 => MessageClass::Request(RequestType::Put),
        0x04 => MessageClass::Request(RequestType::Delete),
        0x05..=0x1F => MessageClass::Request(RequestType::UnKnown(code)),

        0x41 => MessageClass::Response(ResponseType::Created),
        0x42 => MessageClass::Response(ResponseType::Deleted),
        0x43 => MessageClass::Response(ResponseType::Valid),
        0x44 => MessageClass::Response(ResponseType::Changed),
        0x45 => MessageClass::Response(ResponseType::Content),
        0x5F => MessageClass::Response(ResponseType::Continue),

        0x80 => MessageClass::Response(ResponseType::BadRequest),
        0x81 => MessageClass::Response(ResponseType::Unauthorized),
        0x82 => MessageClass::Response(ResponseType::BadOption),
        0x83 => MessageClass::Response(ResponseType::Forbidden),
        0x84 => MessageClass::Response(ResponseType::NotFound),
        0x85 => MessageClass::Response(ResponseType::MethodNotAllowed),
        0x86 => MessageClass::Response(ResponseType::NotAcceptable),
        0x88 => MessageClass::Response(ResponseType::RequestEntityIncomplete),
        0x8C => MessageClass::Response(ResponseType::PreconditionFailed),
        0x8D => MessageClass::Response(ResponseType::RequestEntityTooLarge),
        0x8F => MessageClass::Response(ResponseType::UnsupportedContentFormat),

        0x90 => MessageClass::Response(ResponseType::InternalServerError),
        0x91 => MessageClass::Response(ResponseType::NotImplemented),
        0x92 => MessageClass::Response(ResponseType::BadGateway),
        0x93 => MessageClass::Response(ResponseType::ServiceUnavailable),
        0x94 => MessageClass::Response(ResponseType::GatewayTimeout),
        0x95 => MessageClass::Response(ResponseType::ProxyingNotSupported),
        0x40..=0xBF => MessageClass::Response(ResponseType::UnKnown(code)),

        _ => return None,
    };
    Some(class)
}

pub fn code_to_str(code: u8) -> String {
    let class_code = (0xE0 & code) >> 5;
    let detail_code = 0x1F & code;

    format!("{}.{:02}", class_code, detail_code)
}

pub fn code_from_str(code: &str) -> Option<u8> {
    let (class_code, detail_code) = code.split_once('.')?;
    let class_code = class_code.parse::<u8>().ok()?;
    let detail_code = detail_code.parse::<u8>().ok()?;
    if class_code > 0x07 || detail_code > 0x1F {
        return None;
    }
    Some(class_code << 5 | detail_code)
}

pub fn class_to_str(class: &MessageClass) -> String {
    code_to_str(class_to_code(class))
}
