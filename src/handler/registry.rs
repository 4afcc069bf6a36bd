//! Explicit handler-factory registry, resolved once at startup instead of
//! relying on dynamic import-time registration. `Config` names handlers by
//! string; the registry resolves each name to its setup function before
//! `HandlerChain4`/`HandlerChain6` are constructed. No factory is ever added
//! after `Servers::start`.

use std::collections::HashMap;

use dhcproto::v4;

use crate::error::ConfigError;
use crate::handler::{range, server_id, HandlerV4, HandlerV6};

type FactoryV4 = fn(&[String]) -> Result<HandlerV4, ConfigError>;
type FactoryV6 = fn(&[String]) -> Result<HandlerV6, ConfigError>;

pub struct RegistryV4 {
    factories: HashMap<&'static str, FactoryV4>,
}

pub struct RegistryV6 {
    factories: HashMap<&'static str, FactoryV6>,
}

impl RegistryV4 {
    /// Every v4 handler this core ships: the stateful `range`/`server_id`
    /// handlers plus the trivial out-of-scope option setters.
    pub fn with_builtins() -> Self {
        let mut factories: HashMap<&'static str, FactoryV4> = HashMap::new();
        factories.insert("range", range::setup);
        factories.insert("server_id", server_id::setup_v4);
        factories.insert("file", |a| raw_setter_v4(a, "file", 67));
        factories.insert("router", |a| ip_setter_v4(a, "router", |ip| v4::DhcpOption::Router(vec![ip])));
        factories.insert("netmask", |a| ip_setter_v4(a, "netmask", v4::DhcpOption::SubnetMask));
        factories.insert("dns", |a| ip_setter_v4(a, "dns", |ip| v4::DhcpOption::DomainNameServer(vec![ip])));
        factories.insert(
            "lease_time",
            |a| duration_setter_v4(a, "lease_time", v4::DhcpOption::AddressLeaseTime),
        );
        factories.insert("mtu", |a| u16_setter_v4(a, "mtu", v4::DhcpOption::InterfaceMtu));
        factories.insert("domainname", |a| string_setter_v4(a, "domainname", v4::DhcpOption::DomainName));
        factories.insert("ntp", |a| ip_setter_v4(a, "ntp", |ip| v4::DhcpOption::NTPServers(vec![ip])));
        // The remaining handlers cover option codes `dhcproto`'s typed enum
        // does not model individually; they're stamped as raw TLVs via the
        // catch-all `Unknown` option instead.
        factories.insert("staticroute", |a| raw_setter_v4(a, "staticroute", 33));
        factories.insert("searchdomains", |a| raw_setter_v4(a, "searchdomains", 119));
        factories.insert("nbp", |a| raw_setter_v4(a, "nbp", 67));
        factories.insert("ipv6only", |a| raw_setter_v4(a, "ipv6only", 108));
        factories.insert("autoconfigure", |a| raw_setter_v4(a, "autoconfigure", 116));
        factories.insert("sleep", no_op_v4);
        factories.insert("webhook", no_op_v4);
        Self { factories }
    }

    pub fn build(&self, name: &str, args: &[String]) -> Result<HandlerV4, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownHandler(name.to_string()))?;
        factory(args)
    }
}

impl RegistryV6 {
    pub fn with_builtins() -> Self {
        let mut factories: HashMap<&'static str, FactoryV6> = HashMap::new();
        factories.insert("prefix", crate::handler::prefix::setup);
        factories.insert("server_id", server_id::setup_v6);
        factories.insert("sleep", no_op_v6);
        factories.insert("webhook", no_op_v6);
        Self { factories }
    }

    pub fn build(&self, name: &str, args: &[String]) -> Result<HandlerV6, ConfigError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownHandler(name.to_string()))?;
        factory(args)
    }
}

fn no_op_v4(_args: &[String]) -> Result<HandlerV4, ConfigError> {
    Ok(Box::new(|_req, resp| (resp, false)))
}

fn no_op_v6(_args: &[String]) -> Result<HandlerV6, ConfigError> {
    Ok(Box::new(|_req, resp| (resp, false)))
}

/// Stamps an arbitrary option code with the argument's raw bytes, for the
/// handful of stub handlers whose option `dhcproto`'s typed enum does not
/// model individually.
fn raw_setter_v4(args: &[String], name: &'static str, code: u8) -> Result<HandlerV4, ConfigError> {
    let value = args.first().ok_or(ConfigError::ArgCount {
        handler: name,
        expected: "1",
        got: args.len(),
    })?;
    let option = v4::DhcpOption::Unknown(v4::UnknownOption::new(code, value.clone().into_bytes()));
    Ok(Box::new(move |_req, resp| {
        let Some(mut resp) = resp else {
            return (None, false);
        };
        resp.opts_mut().insert(option.clone());
        (Some(resp), false)
    }))
}

fn string_setter_v4(
    args: &[String],
    name: &'static str,
    build: impl Fn(String) -> v4::DhcpOption + Send + Sync + 'static,
) -> Result<HandlerV4, ConfigError> {
    let value = args
        .first()
        .ok_or(ConfigError::ArgCount {
            handler: name,
            expected: "1",
            got: args.len(),
        })?
        .clone();
    let option = build(value);
    Ok(Box::new(move |_req, resp| {
        let Some(mut resp) = resp else {
            return (None, false);
        };
        resp.opts_mut().insert(option.clone());
        (Some(resp), false)
    }))
}

fn ip_setter_v4(
    args: &[String],
    name: &'static str,
    build: impl Fn(std::net::Ipv4Addr) -> v4::DhcpOption + Send + Sync + 'static,
) -> Result<HandlerV4, ConfigError> {
    let arg = args.first().ok_or(ConfigError::ArgCount {
        handler: name,
        expected: "1 (IPv4 literal)",
        got: args.len(),
    })?;
    let ip: std::net::Ipv4Addr = arg.parse().map_err(|e| ConfigError::InvalidArg {
        handler: name,
        arg: arg.clone(),
        reason: format!("{e}"),
    })?;
    let option = build(ip);
    Ok(Box::new(move |_req, resp| {
        let Some(mut resp) = resp else {
            return (None, false);
        };
        resp.opts_mut().insert(option.clone());
        (Some(resp), false)
    }))
}

fn u16_setter_v4(
    args: &[String],
    name: &'static str,
    build: impl Fn(u16) -> v4::DhcpOption + Send + Sync + 'static,
) -> Result<HandlerV4, ConfigError> {
    let arg = args.first().ok_or(ConfigError::ArgCount {
        handler: name,
        expected: "1 (u16)",
        got: args.len(),
    })?;
    let value: u16 = arg.parse().map_err(|e| ConfigError::InvalidArg {
        handler: name,
        arg: arg.clone(),
        reason: format!("{e}"),
    })?;
    let option = build(value);
    Ok(Box::new(move |_req, resp| {
        let Some(mut resp) = resp else {
            return (None, false);
        };
        resp.opts_mut().insert(option.clone());
        (Some(resp), false)
    }))
}

fn duration_setter_v4(
    args: &[String],
    name: &'static str,
    build: impl Fn(u32) -> v4::DhcpOption + Send + Sync + 'static,
) -> Result<HandlerV4, ConfigError> {
    let arg = args.first().ok_or(ConfigError::ArgCount {
        handler: name,
        expected: "1 (seconds)",
        got: args.len(),
    })?;
    let secs: u32 = arg.parse().map_err(|e| ConfigError::InvalidArg {
        handler: name,
        arg: arg.clone(),
        reason: format!("{e}"),
    })?;
    let option = build(secs);
    Ok(Box::new(move |_req, resp| {
        let Some(mut resp) = resp else {
            return (None, false);
        };
        resp.opts_mut().insert(option.clone());
        (Some(resp), false)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Request4;
    use std::net::{Ipv4Addr, SocketAddr};

    fn req() -> Request4 {
        Request4 {
            message: v4::Message::new(
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                &[0, 1, 2, 3, 4, 5],
            ),
            peer: SocketAddr::from(([127, 0, 0, 1], 68)),
            interface: None,
        }
    }

    fn skeleton() -> v4::Message {
        v4::Message::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::UNSPECIFIED,
            &[0, 1, 2, 3, 4, 5],
        )
    }

    #[test]
    fn unknown_handler_name_is_an_error() {
        let registry = RegistryV4::with_builtins();
        let err = registry.build("does_not_exist", &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHandler(_)));
    }

    #[test]
    fn netmask_setter_inserts_subnet_mask_option() {
        let registry = RegistryV4::with_builtins();
        let handler = registry.build("netmask", &["255.255.255.0".to_string()]).unwrap();
        let (resp, stop) = handler(&req(), Some(skeleton()));
        assert!(!stop);
        assert_eq!(
            resp.unwrap().opts().get(v4::OptionCode::SubnetMask),
            Some(&v4::DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
        );
    }

    #[test]
    fn v6_registry_resolves_prefix_and_server_id() {
        let registry = RegistryV6::with_builtins();
        assert!(registry.build("prefix", &["2001:db8::/56".into(), "64".into()]).is_ok());
        assert!(registry
            .build("server_id", &["LL".into(), "aa:bb:cc:dd:ee:ff".into()])
            .is_ok());
    }
}
