//! CIDR-based allow/deny checks for a single `IngressPath`.

use std::net::IpAddr;

use ipnet::IpNet;
use warren_control::model::AccessControl;

pub fn is_allowed(remote: IpAddr, rules: &AccessControl) -> bool {
    if rules.deny_cidrs.iter().filter_map(|c| c.parse::<IpNet>().ok()).any(|net| net.contains(&remote)) {
        return false;
    }
    if rules.allow_cidrs.is_empty() {
        return true;
    }
    rules.allow_cidrs.iter().filter_map(|c| c.parse::<IpNet>().ok()).any(|net| net.contains(&remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_list_rejects_matching_ip() {
        let rules = AccessControl { allow_cidrs: vec![], deny_cidrs: vec!["10.0.0.0/8".into()] };
        assert!(!is_allowed("10.1.2.3".parse().unwrap(), &rules));
        assert!(is_allowed("192.168.1.1".parse().unwrap(), &rules));
    }

    #[test]
    fn allow_list_rejects_everything_else() {
        let rules = AccessControl { allow_cidrs: vec!["192.168.0.0/16".into()], deny_cidrs: vec![] };
        assert!(is_allowed("192.168.5.5".parse().unwrap(), &rules));
        assert!(!is_allowed("1.2.3.4".parse().unwrap(), &rules));
    }

    #[test]
    fn empty_rules_allow_everything() {
        let rules = AccessControl::default();
        assert!(is_allowed("8.8.8.8".parse().unwrap(), &rules));
    }
}
