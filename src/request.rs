// Copyright 2024-2026 accel-rm Contributors
// Licensed under the Apache License, Version 2.0

//! V1 and V2 request shapes.
//!
//! These carry the packed scalar fields clients send. Each shape decodes
//! once into the typed requests the allocator works with; nothing past
//! this module sees a raw load or constraint word.

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::allocator::{CuListRequest, CuRequest, CuStatus};
use crate::constraint::{Constraints, DeviceConstraint, MemoryConstraint, Policy};
use crate::error::{ResourceError, ResourceResult};
use crate::group::GroupDefinition;
use crate::inventory::CuMatcher;
use crate::load::{Granularity, Load};
use crate::pool::PoolRequest;
use crate::types::{DeviceId, PoolId};

/// Size of the reserved extension block on every request and response.
pub const RESERVED_LEN: usize = 64;

/// Forward-compatibility block. Whatever a client sends is ignored; it is
/// always written back as zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Reserved;

impl Serialize for Reserved {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&[0u8; RESERVED_LEN])
    }
}

impl<'de> Deserialize<'de> for Reserved {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        IgnoredAny::deserialize(deserializer)?;
        Ok(Reserved)
    }
}

fn count(value: i32, what: &str) -> ResourceResult<usize> {
    usize::try_from(value)
        .map_err(|_| ResourceError::InvalidArgument(format!("{} must not be negative", what)))
}

fn kernel_filter(kernel_name: &str, kernel_alias: &str) -> Option<CuMatcher> {
    if kernel_name.is_empty() && kernel_alias.is_empty() {
        None
    } else {
        Some(CuMatcher::Kernel { name: kernel_name.to_string(), alias: kernel_alias.to_string() })
    }
}

fn decode_load(raw: i32) -> ResourceResult<(Load, Granularity)> {
    Load::decode(raw)
}

// -- V1 -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuProperty {
    pub kernel_name: String,
    #[serde(default)]
    pub kernel_alias: String,
    #[serde(default)]
    pub dev_excl: bool,
    pub request_load: i32,
    #[serde(default)]
    pub pool_id: u64,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuProperty {
    pub fn decode(&self) -> ResourceResult<CuRequest> {
        let (load, granularity) = decode_load(self.request_load)?;
        let matcher = CuMatcher::Kernel {
            name: self.kernel_name.clone(),
            alias: self.kernel_alias.clone(),
        };
        let mut req = CuRequest::new(matcher, load)
            .with_granularity(granularity)
            .in_pool(PoolId(self.pool_id));
        req.exclusive = self.dev_excl;
        Ok(req)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuListProperty {
    pub cu_props: Vec<CuProperty>,
    #[serde(default)]
    pub same_device: bool,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuListProperty {
    pub fn decode(&self) -> ResourceResult<CuListRequest> {
        let members = self.cu_props.iter().map(CuProperty::decode).collect::<ResourceResult<_>>()?;
        Ok(CuListRequest { members, same_device: self.same_device })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuPoolProperty {
    pub cu_list_prop: CuListProperty,
    #[serde(default)]
    pub cu_list_num: i32,
    #[serde(default)]
    pub xclbin_uuid: Uuid,
    #[serde(default)]
    pub xclbin_num: i32,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuPoolProperty {
    pub fn decode(&self) -> ResourceResult<PoolRequest> {
        pool_request(
            self.cu_list_prop.decode_if(self.cu_list_num)?,
            self.cu_list_num,
            self.xclbin_uuid,
            self.xclbin_num,
            Vec::new(),
        )
    }
}

impl CuListProperty {
    fn decode_if(&self, copies: i32) -> ResourceResult<Option<CuListRequest>> {
        if copies > 0 && !self.cu_props.is_empty() {
            self.decode().map(Some)
        } else {
            Ok(None)
        }
    }
}

fn pool_request(
    cu_list: Option<CuListRequest>,
    list_num: i32,
    uuid: Uuid,
    xclbin_num: i32,
    allowed_devices: Vec<DeviceId>,
) -> ResourceResult<PoolRequest> {
    let list_count = count(list_num, "cu list count")?;
    let image_count = count(xclbin_num, "xclbin count")?;
    let cu_list = cu_list.map(|list| {
        let members = list
            .members
            .into_iter()
            .map(|m| {
                let constraints = m.constraints.without_policy();
                m.with_constraints(constraints)
            })
            .collect();
        CuListRequest { members, same_device: list.same_device }
    });
    Ok(PoolRequest {
        cu_list,
        list_count,
        image_uuid: (!uuid.is_nil()).then_some(uuid),
        image_count,
        allowed_devices,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfCuProperty {
    /// `kernelName:instanceName`.
    pub cu_name: String,
    #[serde(default)]
    pub dev_excl: bool,
    pub request_load: i32,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl UdfCuProperty {
    fn decode(&self) -> ResourceResult<CuRequest> {
        let (load, granularity) = decode_load(self.request_load)?;
        let mut req = CuRequest::new(CuMatcher::cu_name(&self.cu_name), load).with_granularity(granularity);
        req.exclusive = self.dev_excl;
        Ok(req)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfCuListProperty {
    pub udf_cu_props: Vec<UdfCuProperty>,
    #[serde(default)]
    pub same_device: bool,
    #[serde(default)]
    pub ext_data: Reserved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfCuGroupProperty {
    pub option_udf_cu_list_props: Vec<UdfCuListProperty>,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl UdfCuGroupProperty {
    pub fn decode(&self, name: &str) -> ResourceResult<GroupDefinition> {
        let options = self
            .option_udf_cu_list_props
            .iter()
            .map(|list| {
                let members = list.udf_cu_props.iter().map(UdfCuProperty::decode).collect::<ResourceResult<_>>()?;
                Ok(CuListRequest { members, same_device: list.same_device })
            })
            .collect::<ResourceResult<_>>()?;
        Ok(GroupDefinition { name: name.to_string(), options })
    }
}

/// Group allocation request, shared by V1 and V2.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuGroupProperty {
    pub udf_cu_group_name: String,
    #[serde(default)]
    pub pool_id: u64,
    #[serde(default)]
    pub ext_data: Reserved,
}

/// Lease lookup, shared by V1 and V2.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationQueryInfo {
    pub alloc_service_id: u64,
    #[serde(default)]
    pub kernel_name: String,
    #[serde(default)]
    pub kernel_alias: String,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl AllocationQueryInfo {
    pub fn kernel_filter(&self) -> Option<CuMatcher> {
        kernel_filter(&self.kernel_name, &self.kernel_alias)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationQueryInfo {
    pub pool_id: u64,
    #[serde(default)]
    pub kernel_name: String,
    #[serde(default)]
    pub kernel_alias: String,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl ReservationQueryInfo {
    pub fn kernel_filter(&self) -> Option<CuMatcher> {
        kernel_filter(&self.kernel_name, &self.kernel_alias)
    }
}

/// CU status as returned to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuStat {
    pub is_busy: bool,
    /// Encoded in the scale of the resource that was queried.
    pub used_load: i32,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuStat {
    pub fn encode(status: CuStatus, granularity: Granularity) -> Self {
        Self { is_busy: status.is_busy, used_load: status.used_load.encode(granularity), ext_data: Reserved }
    }
}

// -- V2 -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuPropertyV2 {
    pub kernel_name: String,
    #[serde(default)]
    pub kernel_alias: String,
    #[serde(default)]
    pub dev_excl: bool,
    #[serde(default)]
    pub device_info: u64,
    #[serde(default)]
    pub memory_info: u64,
    #[serde(default)]
    pub policy_info: u64,
    pub request_load: i32,
    #[serde(default)]
    pub pool_id: u64,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuPropertyV2 {
    /// Decode as a single-CU request. A virtual device index only means
    /// something inside a list and is dropped here.
    pub fn decode(&self) -> ResourceResult<CuRequest> {
        let mut constraints = Constraints::decode(self.device_info, self.memory_info, self.policy_info)?;
        if let DeviceConstraint::VirtualIndex(_) = constraints.device {
            constraints.device = DeviceConstraint::None;
        }
        self.decode_with(constraints)
    }

    /// Decode as a list member: policy is cleared, virtual indexes kept.
    fn decode_member(&self) -> ResourceResult<CuRequest> {
        let constraints = Constraints::decode(self.device_info, self.memory_info, self.policy_info)?;
        self.decode_with(constraints.without_policy())
    }

    fn decode_with(&self, constraints: Constraints) -> ResourceResult<CuRequest> {
        let (load, granularity) = decode_load(self.request_load)?;
        let matcher = CuMatcher::Kernel {
            name: self.kernel_name.clone(),
            alias: self.kernel_alias.clone(),
        };
        let mut req = CuRequest::new(matcher, load)
            .with_granularity(granularity)
            .with_constraints(constraints)
            .in_pool(PoolId(self.pool_id));
        req.exclusive = self.dev_excl;
        Ok(req)
    }
}

/// V2 lists colocate through virtual device indexes instead of a flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuListPropertyV2 {
    pub cu_props: Vec<CuPropertyV2>,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuListPropertyV2 {
    pub fn decode(&self) -> ResourceResult<CuListRequest> {
        let members = self
            .cu_props
            .iter()
            .map(CuPropertyV2::decode_member)
            .collect::<ResourceResult<_>>()?;
        Ok(CuListRequest { members, same_device: false })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuPoolPropertyV2 {
    pub cu_list_prop: CuListPropertyV2,
    #[serde(default)]
    pub cu_list_num: i32,
    #[serde(default)]
    pub xclbin_uuid: Uuid,
    #[serde(default)]
    pub xclbin_num: i32,
    /// Only these devices may contribute. Empty means any.
    #[serde(default)]
    pub device_id_list: Vec<u64>,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl CuPoolPropertyV2 {
    pub fn decode(&self) -> ResourceResult<PoolRequest> {
        let list = if self.cu_list_num > 0 && !self.cu_list_prop.cu_props.is_empty() {
            Some(self.cu_list_prop.decode()?)
        } else {
            None
        };
        let allowed = self
            .device_id_list
            .iter()
            .map(|id| {
                DeviceId::try_from(*id)
                    .map_err(|_| ResourceError::InvalidArgument(format!("device id {} out of range", id)))
            })
            .collect::<ResourceResult<Vec<_>>>()?;
        pool_request(list, self.cu_list_num, self.xclbin_uuid, self.xclbin_num, allowed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfCuPropertyV2 {
    /// `kernelName:instanceName`.
    pub cu_name: String,
    #[serde(default)]
    pub dev_excl: bool,
    #[serde(default)]
    pub device_info: u64,
    #[serde(default)]
    pub memory_info: u64,
    pub request_load: i32,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl UdfCuPropertyV2 {
    fn decode(&self) -> ResourceResult<CuRequest> {
        let device = DeviceConstraint::decode(self.device_info)?;
        if let DeviceConstraint::VirtualIndex(_) = device {
            return Err(ResourceError::InvalidConstraint(
                "virtual device index is not valid in a group definition".into(),
            ));
        }
        let constraints = Constraints {
            device,
            memory: MemoryConstraint::decode(self.memory_info)?,
            policy: Policy::None,
        };
        let (load, granularity) = decode_load(self.request_load)?;
        let mut req = CuRequest::new(CuMatcher::cu_name(&self.cu_name), load)
            .with_granularity(granularity)
            .with_constraints(constraints);
        req.exclusive = self.dev_excl;
        Ok(req)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfCuListPropertyV2 {
    pub udf_cu_props: Vec<UdfCuPropertyV2>,
    #[serde(default)]
    pub ext_data: Reserved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdfCuGroupPropertyV2 {
    pub option_udf_cu_list_props: Vec<UdfCuListPropertyV2>,
    #[serde(default)]
    pub ext_data: Reserved,
}

impl UdfCuGroupPropertyV2 {
    pub fn decode(&self, name: &str) -> ResourceResult<GroupDefinition> {
        let options = self
            .option_udf_cu_list_props
            .iter()
            .map(|list| {
                let members = list.udf_cu_props.iter().map(UdfCuPropertyV2::decode).collect::<ResourceResult<_>>()?;
                Ok(CuListRequest { members, same_device: false })
            })
            .collect::<ResourceResult<_>>()?;
        Ok(GroupDefinition { name: name.to_string(), options })
    }
}

// -- Outcome codes ---------------------------------------------------------------

/// Integer outcome: the value on success, the error's negative code otherwise.
pub fn status_code<T: Into<i64>>(result: &ResourceResult<T>) -> i64
where
    T: Copy,
{
    match result {
        Ok(value) => (*value).into(),
        Err(e) => i64::from(e.code()),
    }
}

/// Pool reservation outcome: the pool id, or zero on failure.
pub fn pool_id_or_zero(result: &ResourceResult<PoolId>) -> u64 {
    result.as_ref().map(|id| id.0).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ignores_input_and_writes_zeros() {
        let json = r#"{"kernel_name":"enc","request_load":40,"ext_data":[1,2,3,{"x":true}]}"#;
        let prop: CuProperty = serde_json::from_str(json).unwrap();
        assert_eq!(prop.ext_data, Reserved);

        let out = serde_json::to_value(&prop).unwrap();
        let ext = out["ext_data"].as_array().unwrap();
        assert_eq!(ext.len(), RESERVED_LEN);
        assert!(ext.iter().all(|b| b == 0));
    }

    #[test]
    fn missing_reserved_block_is_accepted() {
        let prop: CuProperty = serde_json::from_str(r#"{"kernel_name":"enc","request_load":40}"#).unwrap();
        assert_eq!(prop.request_load, 40);
    }

    #[test]
    fn v1_decodes_load_scale_and_pool() {
        let prop = CuProperty {
            kernel_name: "enc".into(),
            request_load: 250_000 << 8,
            pool_id: 3,
            dev_excl: true,
            ..Default::default()
        };
        let req = prop.decode().unwrap();
        assert_eq!(req.load.units(), 250_000);
        assert_eq!(req.granularity, Granularity::Fine);
        assert_eq!(req.pool_id, PoolId(3));
        assert!(req.exclusive);
    }

    #[test]
    fn v2_single_drops_virtual_index_and_list_drops_policy() {
        let prop = CuPropertyV2 {
            kernel_name: "enc".into(),
            device_info: (2u64 << 32) | 1,
            policy_info: 2,
            request_load: 10,
            ..Default::default()
        };
        let single = prop.decode().unwrap();
        assert_eq!(single.constraints.device, DeviceConstraint::None);
        assert_eq!(single.constraints.policy, Policy::CuLeastUsedFirst);

        let list = CuListPropertyV2 { cu_props: vec![prop], ext_data: Reserved }.decode().unwrap();
        assert_eq!(list.members[0].constraints.device, DeviceConstraint::VirtualIndex(1));
        assert_eq!(list.members[0].constraints.policy, Policy::None);
    }

    #[test]
    fn unknown_constraint_is_rejected() {
        let prop = CuPropertyV2 {
            kernel_name: "enc".into(),
            memory_info: 5u64 << 32,
            request_load: 10,
            ..Default::default()
        };
        assert!(matches!(prop.decode(), Err(ResourceError::InvalidConstraint(_))));
    }

    #[test]
    fn pool_v2_decodes_allow_list_and_image() {
        let uuid = Uuid::new_v4();
        let prop = CuPoolPropertyV2 {
            xclbin_uuid: uuid,
            xclbin_num: 1,
            device_id_list: vec![0, 2],
            ..Default::default()
        };
        let req = prop.decode().unwrap();
        assert_eq!(req.image_uuid, Some(uuid));
        assert_eq!(req.allowed_devices, vec![0, 2]);
        assert!(req.cu_list.is_none());

        let negative = CuPoolProperty { cu_list_num: -1, ..Default::default() };
        assert!(negative.decode().is_err());
    }

    #[test]
    fn udf_v2_rejects_virtual_index() {
        let group = UdfCuGroupPropertyV2 {
            option_udf_cu_list_props: vec![UdfCuListPropertyV2 {
                udf_cu_props: vec![UdfCuPropertyV2 {
                    cu_name: "enc:enc_0".into(),
                    device_info: 2u64 << 32,
                    request_load: 50,
                    ..Default::default()
                }],
                ext_data: Reserved,
            }],
            ext_data: Reserved,
        };
        assert!(matches!(group.decode("g"), Err(ResourceError::InvalidConstraint(_))));
    }

    #[test]
    fn outcome_codes() {
        let ok: ResourceResult<u32> = Ok(3);
        assert_eq!(status_code(&ok), 3);
        let err: ResourceResult<u32> = Err(ResourceError::NotFound("x".into()));
        assert_eq!(status_code(&err), -5);
        assert_eq!(pool_id_or_zero(&Err(ResourceError::NotFound("p".into()))), 0);
        assert_eq!(pool_id_or_zero(&Ok(PoolId(4))), 4);
    }
}
