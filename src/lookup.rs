//! Object lookup for data sources and imports.
//!
//! A data source locates its object either by `name` or by a `filter` block
//! (`name_regex`, `ip`, and exact attribute matches). Zero matches is a
//! not-found error; several matches is an error that lists every matching
//! ID so the user can pick one.

use std::net::IpAddr;

use regex::Regex;
use serde_json::Value;

use crate::engine::OpContext;
use crate::error::{ProviderError, Result};
use crate::mapping::{pointer_str, AttributeMap};

/// Name of the filter block.
pub const FILTER: &str = "filter";

/// Criteria from a `filter` block.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Regular expression the name must match.
    pub name_regex: Option<Regex>,
    /// Address that must fall within one of the candidate's ranges.
    pub ip: Option<IpAddr>,
    /// Other exact matches, attribute name to value.
    pub attributes: Vec<(String, String)>,
}

impl Filter {
    /// Parse a filter block.
    pub fn from_block(block: &AttributeMap) -> Result<Self> {
        let mut filter = Self::default();
        for key in block.keys() {
            let Some(raw) = block.opt_string(key) else {
                continue;
            };
            match key {
                "name_regex" => {
                    let re = Regex::new(&raw).map_err(|e| {
                        ProviderError::Validation(format!("invalid name_regex '{}': {}", raw, e))
                    })?;
                    filter.name_regex = Some(re);
                },
                "ip" => {
                    let ip = raw.parse().map_err(|_| {
                        ProviderError::Validation(format!("'{}' is not an IP address", raw))
                    })?;
                    filter.ip = Some(ip);
                },
                other => filter.attributes.push((other.to_string(), raw)),
            }
        }
        Ok(filter)
    }

    /// Whether the filter has no criteria.
    pub fn is_empty(&self) -> bool {
        self.name_regex.is_none() && self.ip.is_none() && self.attributes.is_empty()
    }

    /// Whether a candidate satisfies every criterion.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        if let Some(re) = &self.name_regex {
            if !re.is_match(&candidate.name) {
                return false;
            }
        }
        if let Some(ip) = self.ip {
            if !candidate.ranges.iter().any(|r| r.contains(ip)) {
                return false;
            }
        }
        self.attributes
            .iter()
            .all(|(k, v)| candidate.attributes.iter().any(|(ck, cv)| ck == k && cv == v))
    }
}

/// How a data source locates its object.
#[derive(Debug, Clone)]
pub enum LookupCriteria {
    /// By exact name.
    Name(String),
    /// By filter.
    Filter(Filter),
}

impl LookupCriteria {
    /// Pick the criteria from a data source configuration.
    pub fn from_attrs(attrs: &AttributeMap) -> Result<Self> {
        let name = attrs.opt_string("name");
        let filter = attrs.object(FILTER).filter(|f| !f.as_map().is_empty());
        match (name, filter) {
            (Some(_), Some(_)) => Err(ProviderError::Validation(
                "only one of `name` or `filter` can be specified".to_string(),
            )),
            (Some(name), None) => Ok(Self::Name(name)),
            (None, Some(block)) => {
                let filter = Filter::from_block(&block)?;
                if filter.is_empty() {
                    return Err(ProviderError::Validation(
                        "no name or filter criteria provided: `filter` block is empty".to_string(),
                    ));
                }
                Ok(Self::Filter(filter))
            },
            (None, None) => Err(ProviderError::Validation(
                "no name or filter provided: one of `name` or `filter` must be set".to_string(),
            )),
        }
    }
}

/// An inclusive address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    /// First address.
    pub start: IpAddr,
    /// Last address.
    pub end: IpAddr,
}

impl IpRange {
    /// A range between two addresses.
    pub fn new(start: IpAddr, end: IpAddr) -> Self {
        Self { start, end }
    }

    /// Parse `start` and `end` strings.
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        let parse = |s: &str| {
            s.parse::<IpAddr>()
                .map_err(|_| ProviderError::Validation(format!("'{}' is not an IP address", s)))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }

    /// The network a gateway address and prefix length describe.
    pub fn from_cidr(address: &str, prefix_length: u32) -> Result<Self> {
        let ip: IpAddr = address
            .parse()
            .map_err(|_| ProviderError::Validation(format!("'{}' is not an IP address", address)))?;
        let invalid =
            || ProviderError::Validation(format!("invalid prefix length {} for {}", prefix_length, ip));
        match ip {
            IpAddr::V4(v4) => {
                if prefix_length > 32 {
                    return Err(invalid());
                }
                let bits = u32::from(v4);
                let mask = u32::MAX.checked_shl(32 - prefix_length).unwrap_or(0);
                Ok(Self::new(
                    IpAddr::from((bits & mask).to_be_bytes()),
                    IpAddr::from((bits | !mask).to_be_bytes()),
                ))
            },
            IpAddr::V6(v6) => {
                if prefix_length > 128 {
                    return Err(invalid());
                }
                let bits = u128::from(v6);
                let mask = u128::MAX.checked_shl(128 - prefix_length).unwrap_or(0);
                Ok(Self::new(
                    IpAddr::from((bits & mask).to_be_bytes()),
                    IpAddr::from((bits | !mask).to_be_bytes()),
                ))
            },
        }
    }

    /// Parse `a.b.c.d/n`.
    pub fn parse_cidr(cidr: &str) -> Result<Self> {
        let (address, prefix) = cidr
            .split_once('/')
            .ok_or_else(|| ProviderError::Validation(format!("'{}' is not a CIDR", cidr)))?;
        let prefix = prefix
            .parse()
            .map_err(|_| ProviderError::Validation(format!("'{}' is not a CIDR", cidr)))?;
        Self::from_cidr(address, prefix)
    }

    /// Whether `ip` lies in the range. Mixed address families never match.
    pub fn contains(&self, ip: IpAddr) -> bool {
        ip.is_ipv4() == self.start.is_ipv4() && self.start <= ip && ip <= self.end
    }
}

/// An object a filter is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct Candidate {
    /// Object ID.
    pub id: String,
    /// Object name.
    pub name: String,
    /// Address ranges the object covers.
    pub ranges: Vec<IpRange>,
    /// Additional attributes for exact matching.
    pub attributes: Vec<(String, String)>,
}

impl Candidate {
    /// A candidate with an ID and a name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add an address range.
    pub fn with_range(mut self, range: IpRange) -> Self {
        self.ranges.push(range);
        self
    }

    /// Add an attribute for exact matching.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
}

/// Select the single candidate matching `filter`.
pub fn select_one(candidates: Vec<Candidate>, filter: &Filter, what: &str) -> Result<Candidate> {
    let mut matching: Vec<Candidate> = candidates.into_iter().filter(|c| filter.matches(c)).collect();
    match matching.len() {
        0 => Err(ProviderError::NotFound(format!(
            "no {} found matching the filter",
            what
        ))),
        1 => Ok(matching.remove(0)),
        _ => Err(ProviderError::Validation(format!(
            "more than one {} found by filter: [{}]; use `name` or a narrower filter",
            what,
            matching
                .iter()
                .map(|c| c.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Build a FIQL filter such as `name==net1;ownerRef.id==urn%3Avcloud%3A...`.
///
/// Values are percent-encoded so `;`, `,` and the comparison operators in a
/// name cannot split or change the filter.
pub fn fiql(terms: &[(&str, &str)]) -> String {
    terms
        .iter()
        .map(|(k, v)| format!("{}=={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join(";")
}

/// List objects at `endpoint` matching `filter` and return the only one.
pub async fn find_unique(
    ctx: &OpContext,
    endpoint: &str,
    filter: &str,
    what: &str,
) -> Result<Value> {
    let mut found = ctx.list(endpoint, Some(filter)).await?;
    match found.len() {
        0 => Err(ProviderError::NotFound(format!("{} not found ({})", what, filter))),
        1 => Ok(found.remove(0)),
        _ => Err(ProviderError::Validation(format!(
            "more than one {} found ({}): [{}]",
            what,
            filter,
            found
                .iter()
                .filter_map(|v| pointer_str(v, "id"))
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}
