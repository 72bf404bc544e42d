use std::io::{Error, ErrorKind, Result};

use regex::Regex;
use url::Url;

use crate::block::{size_exponent_for, BlockValue};
use crate::message::{CoapOption, Message, MessageType, RequestType as Method};

pub const DEFAULT_PORT: u16 = 5683;
pub const DEFAULT_SECURE_PORT: u16 = 5684;

/// The parts of a `coap://` URL. The host is kept as written, names are
/// not resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub queries: Vec<String>,
}

pub fn parse_coap_url(url: &str) -> Result<CoapUrl> {
    let url_params = match Url::parse(url) {
        Ok(url_params) => url_params,
        Err(_) => return Err(Error::new(ErrorKind::InvalidInput, "url error")),
    };

    let scheme = url_params.scheme().to_string();
    let default_port = match scheme.as_str() {
        "coap" => DEFAULT_PORT,
        "coaps" => DEFAULT_SECURE_PORT,
        _ => return Err(Error::new(ErrorKind::InvalidInput, "scheme error")),
    };

    let host = match url_params.host_str() {
        Some("") | None => return Err(Error::new(ErrorKind::InvalidInput, "host error")),
        Some(h) => h,
    };
    let brackets = Regex::new(r"^\[(.*?)]$").map_err(|e| Error::new(ErrorKind::Other, e))?;
    let host = brackets.replace(host, "$1").to_string();

    let port = url_params.port().unwrap_or(default_port);
    let path = url_params.path().to_string();
    let queries = url_params
        .query()
        .map(|query| {
            query
                .split('&')
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(CoapUrl {
        scheme,
        host,
        port,
        path,
        queries,
    })
}

/// A builder for request messages.
pub struct RequestBuilder<'a> {
    path: &'a str,
    method: Method,
    data: Option<Vec<u8>>,
    queries: Option<Vec<u8>>,
    domain: String,
    confirmable: bool,
    token: Option<Vec<u8>>,
    options: Vec<(CoapOption, Vec<u8>)>,
    block_size: Option<usize>,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(path: &'a str, method: Method) -> Self {
        Self {
            path,
            method,
            data: None,
            queries: None,
            token: None,
            domain: "".to_string(),
            confirmable: true,
            options: vec![],
            block_size: None,
        }
    }

    /// Create a new request with the given path, method, optional payload, optional query, and
    /// domain.
    pub fn request_path(
        path: &'a str,
        method: Method,
        payload: Option<Vec<u8>>,
        query: Option<Vec<u8>>,
        domain: Option<String>,
    ) -> Self {
        let new_self = Self::new(path, method);
        Self {
            data: payload,
            queries: query,
            domain: domain.unwrap_or_default(),
            ..new_self
        }
    }

    /// Set the payload of the request.
    pub fn data(mut self, data: Option<Vec<u8>>) -> Self {
        self.data = data;
        self
    }
    /// Set the queries of the request, `&` separates them.
    pub fn queries(mut self, queries: Option<Vec<u8>>) -> Self {
        self.queries = queries;
        self
    }
    /// Set the domain of the request.
    pub fn domain(mut self, domain: String) -> Self {
        self.domain = domain;
        self
    }
    /// Set whether the request is confirmable.
    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.confirmable = confirmable;
        self
    }
    /// Set the token of the request. Without one the endpoint picks a
    /// random token.
    pub fn token(mut self, token: Option<Vec<u8>>) -> Self {
        self.token = token;
        self
    }
    /// Set the options of the request.
    pub fn options(mut self, options: Vec<(CoapOption, Vec<u8>)>) -> Self {
        self.options = options;
        self
    }
    /// Preferred block size for the body in both directions. Rounded down
    /// to a power of two between 16 and 1024.
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn build(self) -> Message {
        let message_type = match self.confirmable {
            true => MessageType::Confirmable,
            false => MessageType::NonConfirmable,
        };
        let mut request = Message::new_request(self.method, message_type);
        request.set_path(self.path);
        if let Some(queries) = self.queries {
            for query in queries.split(|b| *b == b'&').filter(|q| !q.is_empty()) {
                request.add_option(CoapOption::UriQuery, query.to_vec());
            }
        }
        for (opt, opt_data) in self.options {
            request.add_option(opt, opt_data);
        }
        if !self.domain.is_empty() {
            request.add_option(CoapOption::UriHost, self.domain.as_bytes().to_vec());
        }
        if let Some(block_size) = self.block_size {
            let size_exponent = size_exponent_for(block_size);
            if let Ok(block) = BlockValue::new(0, false, size_exponent) {
                request.set_block2(block);
                if self.data.is_some() {
                    request.set_block1(block);
                }
            }
        }
        if let Some(data) = self.data {
            request.payload = data;
        }
        if let Some(tok) = self.token {
            request.set_token(tok);
        }
        request
    }
}
