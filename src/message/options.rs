use std::collections::BTreeMap;

/// Largest value length the extended length field can express.
pub const MAX_EXTENDED_LENGTH: usize = 269 + 0xFFFF;

/// Default for MAX_AGE when the option is absent, in seconds.
pub const DEFAULT_MAX_AGE: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size,
    ProxyUri,
    ProxyScheme,
    Unknown(u16),
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 16,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Unknown(number) => number,
        }
    }
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            16 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            _ => CoapOption::Unknown(number),
        }
    }
}

impl CoapOption {
    pub fn number(self) -> u16 {
        u16::from(self)
    }

    /// Odd option numbers are critical: a receiver that does not
    /// understand one must reject the message.
    pub fn is_critical(self) -> bool {
        self.number() & 0x01 == 0x01
    }

    pub fn is_known(self) -> bool {
        !matches!(self, CoapOption::Unknown(_))
    }

    pub fn is_repeatable(self) -> bool {
        matches!(
            self,
            CoapOption::IfMatch
                | CoapOption::ETag
                | CoapOption::LocationPath
                | CoapOption::UriPath
                | CoapOption::UriQuery
                | CoapOption::LocationQuery
                | CoapOption::Unknown(_)
        )
    }

    pub fn max_length(self) -> usize {
        match self {
            CoapOption::IfMatch => 8,
            CoapOption::UriHost => 255,
            CoapOption::ETag => 8,
            CoapOption::IfNoneMatch => 0,
            CoapOption::Observe => 3,
            CoapOption::UriPort => 2,
            CoapOption::LocationPath => 255,
            CoapOption::UriPath => 255,
            CoapOption::ContentFormat => 2,
            CoapOption::MaxAge => 4,
            CoapOption::UriQuery => 255,
            CoapOption::Accept => 2,
            CoapOption::LocationQuery => 255,
            CoapOption::Block2 => 3,
            CoapOption::Block1 => 3,
            CoapOption::Size => 4,
            CoapOption::ProxyUri => 1034,
            CoapOption::ProxyScheme => 255,
            CoapOption::Unknown(_) => MAX_EXTENDED_LENGTH,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
}

impl ContentFormat {
    pub fn from_u16(value: u16) -> Option<ContentFormat> {
        match value {
            0 => Some(ContentFormat::TextPlain),
            40 => Some(ContentFormat::ApplicationLinkFormat),
            41 => Some(ContentFormat::ApplicationXML),
            42 => Some(ContentFormat::ApplicationOctetStream),
            47 => Some(ContentFormat::ApplicationEXI),
            50 => Some(ContentFormat::ApplicationJSON),
            60 => Some(ContentFormat::ApplicationCBOR),
            _ => None,
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ObserveOption {
    Register = 0,
    Deregister = 1,
}

/// Encodes an unsigned integer option value with the fewest bytes,
/// zero encoding as the empty value.
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes an unsigned integer option value. `None` if longer than 4 bytes.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b)))
}

/// Message options keyed by number. Iteration yields ascending numbers,
/// values of a repeated option in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    options: BTreeMap<u16, Vec<Vec<u8>>>,
}

impl OptionSet {
    pub fn new() -> OptionSet {
        OptionSet::default()
    }

    /// Adds a value. Repeatable options accumulate; unique options
    /// replace any previous value.
    pub fn add(&mut self, option: CoapOption, value: Vec<u8>) {
        if option.is_repeatable() {
            self.push(option.number(), value);
        } else {
            self.set(option, value);
        }
    }

    pub fn set(&mut self, option: CoapOption, value: Vec<u8>) {
        self.options.insert(option.number(), vec![value]);
    }

    /// Appends a raw value without applying uniqueness, as read off the wire.
    pub fn push(&mut self, number: u16, value: Vec<u8>) {
        self.options.entry(number).or_default().push(value);
    }

    pub fn get(&self, option: CoapOption) -> Option<&[Vec<u8>]> {
        self.options.get(&option.number()).map(|values| values.as_slice())
    }

    pub fn get_first(&self, option: CoapOption) -> Option<&Vec<u8>> {
        self.options.get(&option.number()).and_then(|values| values.first())
    }

    pub fn remove(&mut self, option: CoapOption) -> Option<Vec<Vec<u8>>> {
        self.options.remove(&option.number())
    }

    pub fn contains(&self, option: CoapOption) -> bool {
        self.options.contains_key(&option.number())
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    /// Number of option instances.
    pub fn len(&self) -> usize {
        self.options.values().map(|values| values.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &Vec<u8>)> {
        self.options
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |value| (*number, value)))
    }

    /// The lowest critical option number this implementation does not know.
    pub fn first_unknown_critical(&self) -> Option<u16> {
        self.options
            .keys()
            .map(|number| CoapOption::from(*number))
            .find(|option| option.is_critical() && !option.is_known())
            .map(CoapOption::number)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_option_numbers_round_trip() {
        for number in 0..=300u16 {
            assert_eq!(CoapOption::from(number).number(), number);
        }
        assert_eq!(CoapOption::Accept.number(), 16);
        assert_eq!(CoapOption::Size.number(), 28);
    }

    #[test]
    fn test_critical_and_repeatable() {
        assert!(CoapOption::UriPath.is_critical());
        assert!(CoapOption::Block1.is_critical());
        assert!(!CoapOption::ETag.is_critical());
        assert!(!CoapOption::Observe.is_critical());
        assert!(CoapOption::Unknown(99).is_critical());

        assert!(CoapOption::UriQuery.is_repeatable());
        assert!(!CoapOption::ContentFormat.is_repeatable());
    }

    #[test]
    fn test_unique_option_replaces() {
        let mut options = OptionSet::new();
        options.add(CoapOption::ContentFormat, vec![0]);
        options.add(CoapOption::ContentFormat, vec![50]);
        options.add(CoapOption::UriPath, b"a".to_vec());
        options.add(CoapOption::UriPath, b"b".to_vec());

        assert_eq!(options.get(CoapOption::ContentFormat).unwrap(), &[vec![50]]);
        assert_eq!(options.get(CoapOption::UriPath).unwrap().len(), 2);
        assert_eq!(options.len(), 3);

        let numbers: Vec<u16> = options.iter().map(|(number, _)| number).collect();
        assert_eq!(numbers, vec![11, 11, 12]);
    }

    #[test]
    fn test_first_unknown_critical() {
        let mut options = OptionSet::new();
        options.push(98, vec![1]);
        assert_eq!(options.first_unknown_critical(), None);
        options.push(99, vec![1]);
        options.push(11, b"x".to_vec());
        assert_eq!(options.first_unknown_critical(), Some(99));
    }

    #[test]
    fn test_uint_values() {
        assert_eq!(encode_uint(0), Vec::<u8>::new());
        assert_eq!(encode_uint(60), vec![60]);
        assert_eq!(encode_uint(0x1_0000), vec![1, 0, 0]);
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[1, 0, 0]), Some(0x1_0000));
        assert_eq!(decode_uint(&[1, 2, 3, 4, 5]), None);
    }
}
