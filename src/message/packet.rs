use super::header::{
    Header, HeaderRaw, MessageClass, MessageType, RequestType, ResponseType, HEADER_LEN,
};
use super::options::{
    decode_uint, encode_uint, CoapOption, ContentFormat, ObserveOption, OptionSet,
    DEFAULT_MAX_AGE,
};
use crate::error::{BadOption, DecodeError, EncodingError, FormatError};

/// Separates the options from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// Longest token the header can announce.
pub const MAX_TOKEN_LENGTH: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    token: Vec<u8>,
    options: OptionSet,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new() -> Message {
        Message {
            header: Header::new(),
            token: Vec::new(),
            options: OptionSet::new(),
            payload: Vec::new(),
        }
    }

    pub fn new_request(method: RequestType, message_type: MessageType) -> Message {
        let mut message = Message::new();
        message.header.set_type(message_type);
        message.header.code = MessageClass::Request(method);
        message
    }

    /// An empty acknowledgement for `message_id`.
    pub fn new_ack(message_id: u16) -> Message {
        let mut message = Message::new();
        message.header.set_type(MessageType::Acknowledgement);
        message.header.set_message_id(message_id);
        message
    }

    /// An empty reset for `message_id`.
    pub fn new_reset(message_id: u16) -> Message {
        let mut message = Message::new();
        message.header.set_type(MessageType::Reset);
        message.header.set_message_id(message_id);
        message
    }

    /// A response skeleton carrying the request's token. The message type
    /// and ID are decided when the response is sent.
    pub fn new_response(request: &Message, status: ResponseType) -> Message {
        let mut message = Message::new();
        message.header.set_type(MessageType::Acknowledgement);
        message.header.code = MessageClass::Response(status);
        message.header.set_message_id(request.header.get_message_id());
        message.set_token(request.get_token().to_vec());
        message
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    pub fn options(&self) -> &OptionSet {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut OptionSet {
        &mut self.options
    }

    pub fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options.add(tp, value);
    }

    pub fn set_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options.set(tp, value);
    }

    pub fn get_option(&self, tp: CoapOption) -> Option<&[Vec<u8>]> {
        self.options.get(tp)
    }

    pub fn get_first_option(&self, tp: CoapOption) -> Option<&Vec<u8>> {
        self.options.get_first(tp)
    }

    pub fn clear_option(&mut self, tp: CoapOption) {
        self.options.remove(tp);
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    pub fn is_request(&self) -> bool {
        matches!(self.header.code, MessageClass::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.header.code, MessageClass::Response(_))
    }

    pub fn is_empty(&self) -> bool {
        self.header.code == MessageClass::Empty
    }

    pub fn is_confirmable(&self) -> bool {
        self.header.get_type() == MessageType::Confirmable
    }

    pub fn get_method(&self) -> Option<RequestType> {
        match self.header.code {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    pub fn get_status(&self) -> Option<ResponseType> {
        match self.header.code {
            MessageClass::Response(status) => Some(status),
            _ => None,
        }
    }

    /// Replaces the URI_PATH options with the segments of `path`.
    pub fn set_path(&mut self, path: &str) {
        self.options.remove(CoapOption::UriPath);
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            self.options.push(CoapOption::UriPath.number(), segment.as_bytes().to_vec());
        }
    }

    pub fn get_path(&self) -> String {
        self.get_option(CoapOption::UriPath)
            .map(|segments| {
                segments
                    .iter()
                    .map(|segment| String::from_utf8_lossy(segment))
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.set_option(CoapOption::ContentFormat, encode_uint(cf as u32));
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        let value = decode_uint(self.get_first_option(CoapOption::ContentFormat)?)?;
        u16::try_from(value).ok().and_then(ContentFormat::from_u16)
    }

    /// MAX_AGE in seconds, 60 when absent.
    pub fn get_max_age(&self) -> u32 {
        self.get_first_option(CoapOption::MaxAge)
            .and_then(|value| decode_uint(value))
            .unwrap_or(DEFAULT_MAX_AGE)
    }

    pub fn set_observe_value(&mut self, value: u32) {
        self.set_option(CoapOption::Observe, encode_uint(value & 0xFF_FFFF));
    }

    pub fn get_observe_value(&self) -> Option<u32> {
        self.get_first_option(CoapOption::Observe)
            .and_then(|value| decode_uint(value))
    }

    /// The OBSERVE option read as a request flag.
    pub fn get_observe_flag(&self) -> Option<ObserveOption> {
        match self.get_observe_value()? {
            0 => Some(ObserveOption::Register),
            1 => Some(ObserveOption::Deregister),
            _ => None,
        }
    }

    /// Checks the invariants `to_bytes` relies on.
    pub fn validate(&self) -> Result<(), EncodingError> {
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(EncodingError::TokenTooLong(self.token.len()));
        }

        for (number, value) in self.options.iter() {
            let max = CoapOption::from(number).max_length();
            if value.len() > max {
                return Err(EncodingError::OptionTooLong {
                    number,
                    length: value.len(),
                    max,
                });
            }
        }

        let message_type = self.header.get_type();
        let valid = match self.header.code {
            MessageClass::Empty => {
                if !matches!(message_type, MessageType::Acknowledgement | MessageType::Reset) {
                    false
                } else if !self.token.is_empty()
                    || !self.options.is_empty()
                    || !self.payload.is_empty()
                {
                    return Err(EncodingError::NonEmptyEmptyMessage);
                } else {
                    true
                }
            }
            MessageClass::Request(_) => {
                matches!(message_type, MessageType::Confirmable | MessageType::NonConfirmable)
            }
            MessageClass::Response(_) => message_type != MessageType::Reset,
        };

        if valid {
            Ok(())
        } else {
            Err(EncodingError::InvalidCombination {
                code: self.header.code,
                message_type,
            })
        }
    }

    /// Decodes a byte slice and construct the equivalent Message.
    pub fn from_bytes(buf: &[u8]) -> Result<Message, DecodeError> {
        let raw = HeaderRaw::from_bytes(buf)?;
        let header = Header::from_raw(&raw)?;

        let token_length = raw.token_length();
        if token_length as usize > MAX_TOKEN_LENGTH {
            return Err(FormatError::InvalidTokenLength(token_length).into());
        }
        if header.code == MessageClass::Empty && buf.len() > HEADER_LEN {
            return Err(FormatError::NonEmptyEmptyMessage(buf.len() - HEADER_LEN).into());
        }

        let options_start = HEADER_LEN + token_length as usize;
        if options_start > buf.len() {
            return Err(FormatError::TruncatedToken(token_length).into());
        }
        let token = buf[HEADER_LEN..options_start].to_vec();

        let mut idx = options_start;
        let mut option_number: usize = 0;
        let mut options = OptionSet::new();
        let mut payload = Vec::new();
        while idx < buf.len() {
            let byte = buf[idx];
            idx += 1;

            if byte == PAYLOAD_MARKER {
                if idx == buf.len() {
                    return Err(FormatError::EmptyPayload.into());
                }
                payload = buf[idx..].to_vec();
                break;
            }

            let delta = read_extended(buf, &mut idx, byte >> 4, FormatError::InvalidOptionDelta)?;
            let length =
                read_extended(buf, &mut idx, byte & 0x0F, FormatError::InvalidOptionLength)?;

            option_number += delta;
            let number =
                u16::try_from(option_number).map_err(|_| FormatError::InvalidOptionDelta)?;

            let end = idx + length;
            if end > buf.len() {
                return Err(FormatError::TruncatedOption.into());
            }
            options.push(number, buf[idx..end].to_vec());
            idx = end;
        }

        if let Some(number) = options.first_unknown_critical() {
            return Err(BadOption {
                number,
                message_type: header.get_type(),
                code: header.code,
                message_id: header.get_message_id(),
                token,
            }
            .into());
        }

        Ok(Message {
            header,
            token,
            options,
            payload,
        })
    }

    /// Returns a vector of bytes representing the Message.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodingError> {
        self.validate()?;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.token.len() + 1 + self.payload.len());
        self.header
            .to_raw(self.token.len() as u8)
            .write_to(&mut buf);
        buf.extend_from_slice(&self.token);

        let mut last_number = 0u16;
        for (number, value) in self.options.iter() {
            let delta = usize::from(number - last_number);
            last_number = number;

            buf.push(nibble(delta) << 4 | nibble(value.len()));
            write_extended(&mut buf, delta);
            write_extended(&mut buf, value.len());
            buf.extend_from_slice(value);
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }
        Ok(buf)
    }
}

fn nibble(value: usize) -> u8 {
    match value {
        0..=12 => value as u8,
        13..=268 => 13,
        _ => 14,
    }
}

fn write_extended(buf: &mut Vec<u8>, value: usize) {
    match value {
        0..=12 => {}
        13..=268 => buf.push((value - 13) as u8),
        _ => buf.extend_from_slice(&((value - 269) as u16).to_be_bytes()),
    }
}

fn read_extended(
    buf: &[u8],
    idx: &mut usize,
    nibble: u8,
    reserved: FormatError,
) -> Result<usize, FormatError> {
    match nibble {
        13 => {
            let byte = *buf.get(*idx).ok_or(FormatError::TruncatedOption)?;
            *idx += 1;
            Ok(usize::from(byte) + 13)
        }
        14 => {
            if *idx + 2 > buf.len() {
                return Err(FormatError::TruncatedOption);
            }
            let value = u16::from_be_bytes([buf[*idx], buf[*idx + 1]]);
            *idx += 2;
            Ok(usize::from(value) + 269)
        }
        15 => Err(reserved),
        _ => Ok(usize::from(nibble)),
    }
}

#[cfg(test)]
mod test {
    use super::super::header::code_to_class;
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    const OPTION_NUMBERS: &[u16] = &[
        1, 2, 3, 4, 5, 6, 7, 8, 11, 12, 14, 15, 16, 20, 23, 27, 28, 35, 39, 40, 1000, 2048,
    ];

    impl Arbitrary for Message {
        fn arbitrary(g: &mut Gen) -> Self {
            let mut message = Message::new();
            message.header.set_message_id(u16::arbitrary(g));

            let code = match u8::arbitrary(g) % 3 {
                0 => {
                    let types = [MessageType::Acknowledgement, MessageType::Reset];
                    message.header.set_type(*g.choose(&types).unwrap());
                    return message;
                }
                1 => {
                    let types = [MessageType::Confirmable, MessageType::NonConfirmable];
                    message.header.set_type(*g.choose(&types).unwrap());
                    1 + u8::arbitrary(g) % 31
                }
                _ => {
                    let types = [
                        MessageType::Confirmable,
                        MessageType::NonConfirmable,
                        MessageType::Acknowledgement,
                    ];
                    message.header.set_type(*g.choose(&types).unwrap());
                    0x40 + u8::arbitrary(g) % 0x80
                }
            };
            message.header.code = code_to_class(code).unwrap();

            let token_length = usize::arbitrary(g) % (MAX_TOKEN_LENGTH + 1);
            message.set_token((0..token_length).map(|_| u8::arbitrary(g)).collect());

            for _ in 0..usize::arbitrary(g) % 6 {
                let number = *g.choose(OPTION_NUMBERS).unwrap();
                let max = CoapOption::from(number).max_length().min(300);
                let length = usize::arbitrary(g) % (max + 1);
                let value = (0..length).map(|_| u8::arbitrary(g)).collect();
                message.add_option(CoapOption::from(number), value);
            }

            message.payload = Vec::<u8>::arbitrary(g);
            message
        }
    }

    #[test]
    fn test_decode_packet_with_options() {
        let buf = [
            0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54, 0x65,
            0x73, 0x74, 0x43, 0x61, 0x3d, 0x31,
        ];
        let packet = Message::from_bytes(&buf).unwrap();
        assert_eq!(packet.header.get_type(), MessageType::Confirmable);
        assert_eq!(packet.header.code, MessageClass::Request(RequestType::Get));
        assert_eq!(packet.header.get_message_id(), 33950);
        assert_eq!(packet.get_token(), &[0x51, 0x55, 0x77, 0xE8]);
        assert_eq!(packet.options().len(), 3);

        let uri_path = packet.get_option(CoapOption::UriPath).unwrap();
        assert_eq!(uri_path, &[b"Hi".to_vec(), b"Test".to_vec()]);
        assert_eq!(packet.get_path(), "Hi/Test");

        let uri_query = packet.get_option(CoapOption::UriQuery).unwrap();
        assert_eq!(uri_query, &[b"a=1".to_vec()]);
    }

    #[test]
    fn test_decode_packet_with_payload() {
        let buf = [
            0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C, 0x6F,
        ];
        let packet = Message::from_bytes(&buf).unwrap();
        assert_eq!(packet.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(packet.header.code, MessageClass::Response(ResponseType::Content));
        assert_eq!(packet.header.get_message_id(), 5117);
        assert_eq!(packet.get_token(), &[0xD0, 0xE2, 0x4D, 0xAC]);
        assert_eq!(packet.payload, b"Hello".to_vec());
    }

    #[test]
    fn test_encode_packet_with_options() {
        let mut packet = Message::new_request(RequestType::Get, MessageType::Confirmable);
        packet.header.set_message_id(33950);
        packet.set_token(vec![0x51, 0x55, 0x77, 0xE8]);
        packet.add_option(CoapOption::UriPath, b"Hi".to_vec());
        packet.add_option(CoapOption::UriPath, b"Test".to_vec());
        packet.add_option(CoapOption::UriQuery, b"a=1".to_vec());
        assert_eq!(
            packet.to_bytes().unwrap(),
            vec![
                0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54,
                0x65, 0x73, 0x74, 0x43, 0x61, 0x3d, 0x31
            ]
        );
    }

    #[test]
    fn test_encode_packet_with_payload() {
        let mut packet = Message::new();
        packet.header.set_type(MessageType::Acknowledgement);
        packet.header.code = MessageClass::Response(ResponseType::Content);
        packet.header.set_message_id(5117);
        packet.set_token(vec![0xD0, 0xE2, 0x4D, 0xAC]);
        packet.payload = b"Hello".to_vec();
        assert_eq!(
            packet.to_bytes().unwrap(),
            vec![
                0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C,
                0x6F
            ]
        );
    }

    #[test]
    fn test_extended_delta_and_length() {
        let mut packet = Message::new_request(RequestType::Post, MessageType::NonConfirmable);
        packet.add_option(CoapOption::ProxyUri, vec![b'a'; 20]);
        packet.add_option(CoapOption::Unknown(1000), vec![b'b'; 300]);
        let bytes = packet.to_bytes().unwrap();

        // delta 35 -> nibble 13 + (35 - 13), length 20 -> nibble 13 + (20 - 13)
        assert_eq!(&bytes[4..7], &[0xDD, 22, 7]);
        assert_eq!(Message::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_encode_decode_content_format() {
        let mut packet = Message::new();
        packet.set_content_format(ContentFormat::ApplicationJSON);
        assert_eq!(ContentFormat::ApplicationJSON, packet.get_content_format().unwrap())
    }

    #[test]
    fn test_decode_empty_content_format() {
        let packet = Message::new();
        assert!(packet.get_content_format().is_none());
        assert_eq!(packet.get_max_age(), 60);
    }

    #[test]
    fn test_encoding_errors() {
        let mut packet = Message::new_request(RequestType::Get, MessageType::Confirmable);
        packet.set_token(vec![0; 9]);
        assert_eq!(packet.to_bytes(), Err(EncodingError::TokenTooLong(9)));

        let mut packet = Message::new_request(RequestType::Get, MessageType::Confirmable);
        packet.add_option(CoapOption::ETag, vec![0; 9]);
        assert_eq!(
            packet.to_bytes(),
            Err(EncodingError::OptionTooLong {
                number: 4,
                length: 9,
                max: 8
            })
        );

        let mut reset = Message::new_reset(7);
        reset.payload = b"oops".to_vec();
        assert_eq!(reset.to_bytes(), Err(EncodingError::NonEmptyEmptyMessage));

        let mut packet = Message::new_request(RequestType::Get, MessageType::Acknowledgement);
        assert!(matches!(
            packet.to_bytes(),
            Err(EncodingError::InvalidCombination { .. })
        ));
        packet.header.code = MessageClass::Empty;
        packet.header.set_type(MessageType::NonConfirmable);
        assert!(matches!(
            packet.to_bytes(),
            Err(EncodingError::InvalidCombination { .. })
        ));
    }

    #[test]
    fn test_format_errors() {
        let format = |buf: &[u8]| match Message::from_bytes(buf) {
            Err(DecodeError::Format(e)) => e,
            other => panic!("expected a format error, got {:?}", other),
        };

        assert_eq!(format(&[0x40, 0x01, 0x00]), FormatError::HeaderTooShort(3));
        assert_eq!(format(&[0x80, 0x01, 0x00, 0x01]), FormatError::InvalidVersion(2));
        assert_eq!(format(&[0x49, 0x01, 0x00, 0x01]), FormatError::InvalidTokenLength(9));
        assert_eq!(format(&[0x44, 0x01, 0x00, 0x01, 0xAA]), FormatError::TruncatedToken(4));
        assert_eq!(format(&[0x40, 0x01, 0x00, 0x01, 0xD1]), FormatError::TruncatedOption);
        assert_eq!(format(&[0x40, 0x01, 0x00, 0x01, 0xB4, 0x61]), FormatError::TruncatedOption);
        assert_eq!(format(&[0x40, 0x01, 0x00, 0x01, 0xF0]), FormatError::InvalidOptionDelta);
        assert_eq!(format(&[0x40, 0x01, 0x00, 0x01, 0x0F]), FormatError::InvalidOptionLength);
        assert_eq!(format(&[0x40, 0x01, 0x00, 0x01, 0xFF]), FormatError::EmptyPayload);
        assert_eq!(format(&[0x60, 0x00, 0x00, 0x01, 0xFF]), FormatError::NonEmptyEmptyMessage(1));
    }

    #[test]
    fn test_unknown_critical_option() {
        let mut packet = Message::new_request(RequestType::Get, MessageType::Confirmable);
        packet.header.set_message_id(42);
        packet.set_token(vec![0x7A]);
        packet.add_option(CoapOption::Unknown(99), b"x".to_vec());
        let bytes = packet.to_bytes().unwrap();

        match Message::from_bytes(&bytes) {
            Err(DecodeError::BadOption(bad)) => {
                assert_eq!(bad.number, 99);
                assert_eq!(bad.message_id, 42);
                assert_eq!(bad.token, vec![0x7A]);
                assert!(bad.is_request());
            }
            other => panic!("expected bad option, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_elective_option_is_preserved() {
        let mut packet = Message::new_request(RequestType::Get, MessageType::Confirmable);
        packet.add_option(CoapOption::Unknown(98), b"x".to_vec());
        let decoded = Message::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(
            decoded.get_first_option(CoapOption::Unknown(98)),
            Some(&b"x".to_vec())
        );
    }

    #[test]
    fn test_round_trip() {
        fn run(message: Message) -> bool {
            let bytes = message.to_bytes().unwrap();
            Message::from_bytes(&bytes).unwrap() == message
        }
        QuickCheck::new()
            .tests(2000)
            .quickcheck(run as fn(Message) -> bool)
    }

    #[test]
    fn test_malicious_packet() {
        fn run(x: Vec<u8>) -> TestResult {
            match Message::from_bytes(&x[..]) {
                Ok(packet) => TestResult::from_bool(
                    packet.get_token().len() == (x[0] & 0x0F) as usize
                        && packet.get_token().len() <= MAX_TOKEN_LENGTH,
                ),
                Err(_) => TestResult::passed(),
            }
        }
        QuickCheck::new()
            .tests(10000)
            .gen(Gen::new(1500))
            .quickcheck(run as fn(Vec<u8>) -> TestResult)
    }
}
