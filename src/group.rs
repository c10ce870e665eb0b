// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Registry of user-defined CU groups.
//!
//! A group is a template: an ordered list of alternative CU lists. It is
//! resolved at allocation time, so undeclaring a group never touches the
//! leases that were granted through it.

use std::collections::BTreeMap;

use crate::allocator::CuListRequest;
use crate::error::{ResourceError, ResourceResult};
use crate::limits::ManagerLimits;
use crate::types::PoolId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDefinition {
    pub name: String,
    /// Tried in this order; the first that fits entirely wins.
    pub options: Vec<CuListRequest>,
}

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<String, GroupDefinition>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, definition: GroupDefinition, limits: &ManagerLimits) -> ResourceResult<()> {
        let name = &definition.name;
        if name.is_empty() || name.len() > limits.max_name_len {
            return Err(ResourceError::InvalidArgument(format!(
                "group name must be 1..={} bytes",
                limits.max_name_len
            )));
        }
        if definition.options.is_empty() || definition.options.len() > limits.max_group_options {
            return Err(ResourceError::InvalidArgument(format!(
                "group {} must declare 1..={} options",
                name, limits.max_group_options
            )));
        }
        for option in &definition.options {
            option.validate(limits)?;
            if option.pool_id() != PoolId::DEFAULT {
                return Err(ResourceError::InvalidArgument(format!(
                    "group {} options may not name a pool",
                    name
                )));
            }
        }
        if self.groups.contains_key(name) {
            return Err(ResourceError::InvalidArgument(format!("group {} already declared", name)));
        }
        self.groups.insert(name.clone(), definition);
        Ok(())
    }

    pub fn undeclare(&mut self, name: &str) -> ResourceResult<GroupDefinition> {
        self.groups
            .remove(name)
            .ok_or_else(|| ResourceError::NotFound(format!("group {}", name)))
    }

    pub fn get(&self, name: &str) -> ResourceResult<&GroupDefinition> {
        self.groups
            .get(name)
            .ok_or_else(|| ResourceError::NotFound(format!("group {}", name)))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CuRequest;
    use crate::inventory::CuMatcher;
    use crate::load::Load;

    fn option(cu: &str) -> CuListRequest {
        CuListRequest::new(vec![CuRequest::new(CuMatcher::cu_name(cu), Load::FULL)])
    }

    #[test]
    fn declare_get_undeclare() {
        let limits = ManagerLimits::default();
        let mut registry = GroupRegistry::new();
        registry
            .declare(
                GroupDefinition { name: "g1".into(), options: vec![option("enc:enc_0")] },
                &limits,
            )
            .unwrap();
        assert_eq!(registry.get("g1").unwrap().options.len(), 1);

        let dup = GroupDefinition { name: "g1".into(), options: vec![option("enc:enc_1")] };
        assert!(matches!(registry.declare(dup, &limits), Err(ResourceError::InvalidArgument(_))));

        registry.undeclare("g1").unwrap();
        assert!(matches!(registry.get("g1"), Err(ResourceError::NotFound(_))));
        assert!(registry.undeclare("g1").is_err());
    }

    #[test]
    fn rejects_malformed_groups() {
        let limits = ManagerLimits { max_group_options: 1, ..Default::default() };
        let mut registry = GroupRegistry::new();

        let empty = GroupDefinition { name: "g".into(), options: vec![] };
        assert!(registry.declare(empty, &limits).is_err());

        let too_many = GroupDefinition { name: "g".into(), options: vec![option("a:b"), option("c:d")] };
        assert!(registry.declare(too_many, &limits).is_err());

        let pooled = GroupDefinition {
            name: "g".into(),
            options: vec![option("a:b").in_pool(PoolId(4))],
        };
        assert!(registry.declare(pooled, &limits).is_err());
        assert!(registry.is_empty());
    }
}
