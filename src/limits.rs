// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! Size limits applied to requests and to the inventory.

use serde::{Deserialize, Serialize};

/// Highest extension function id a plugin may expose.
pub const MAX_PLUGIN_FUNC_ID: u32 = 8;

/// Bounds enforced at the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerLimits {
    /// Maximum CUs in one list request.
    pub max_list_cus: usize,
    /// Maximum option lists in one group declaration.
    pub max_group_options: usize,
    /// Maximum live channels on one CU.
    pub max_channels_per_cu: usize,
    /// Number of device slots. Device ids are `0..max_devices`.
    pub max_devices: u32,
    /// Maximum length of kernel, alias, CU and group names.
    pub max_name_len: usize,
    /// Maximum length of a plugin input or output buffer.
    pub max_plugin_param_len: usize,
    /// Maximum CU-list copies or image copies in one pool request.
    pub max_pool_lists: usize,
}

impl Default for ManagerLimits {
    fn default() -> Self {
        Self {
            max_list_cus: 64,
            max_group_options: 32,
            max_channels_per_cu: 64,
            max_devices: 128,
            max_name_len: 256,
            max_plugin_param_len: 16 * 1024,
            max_pool_lists: 128,
        }
    }
}

impl ManagerLimits {
    /// Clamp every bound to at least one.
    pub fn sanitized(mut self) -> Self {
        self.max_list_cus = self.max_list_cus.max(1);
        self.max_group_options = self.max_group_options.max(1);
        self.max_channels_per_cu = self.max_channels_per_cu.max(1);
        self.max_devices = self.max_devices.max(1);
        self.max_name_len = self.max_name_len.max(1);
        self.max_plugin_param_len = self.max_plugin_param_len.max(1);
        self.max_pool_lists = self.max_pool_lists.max(1);
        self
    }
}
