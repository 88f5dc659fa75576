//! Subnet listing for the instance's availability zone, tag-filtered and
//! ordered by descending available-address count for placement.

use std::collections::HashMap;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub cidr: Ipv4Network,
    pub is_default: bool,
    pub available_address_count: u32,
    pub name: String,
    pub tags: HashMap<String, String>,
}

/// Sorts subnets by descending available-address count, the same ordering
/// both the placement policy and new-interface creation use to prefer the
/// roomiest subnet first.
pub fn by_available_address_count_desc(mut subnets: Vec<Subnet>) -> Vec<Subnet> {
    subnets.sort_by(|a, b| b.available_address_count.cmp(&a.available_address_count));
    subnets
}

/// Filters to subnets matching every required tag; an empty filter set
/// matches everything.
pub fn matching_tags<'a>(subnets: &'a [Subnet], required: &HashMap<String, String>) -> Vec<&'a Subnet> {
    subnets
        .iter()
        .filter(|s| required.iter().all(|(k, v)| s.tags.get(k) == Some(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subnet(id: &str, avail: u32) -> Subnet {
        Subnet {
            id: id.to_string(),
            cidr: "10.0.0.0/24".parse().unwrap(),
            is_default: false,
            available_address_count: avail,
            name: String::new(),
            tags: HashMap::new(),
        }
    }

    #[test]
    fn orders_by_available_desc() {
        let subnets = vec![subnet("a", 5), subnet("b", 50), subnet("c", 10)];
        let sorted = by_available_address_count_desc(subnets);
        assert_eq!(sorted[0].id, "b");
        assert_eq!(sorted[2].id, "a");
    }
}
