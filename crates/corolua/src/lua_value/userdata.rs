use std::any::Any;

use crate::gc::GcHeader;
use crate::lua_value::value::TablePtr;

/// Full userdata: a host-owned payload with optional metatable and
/// environment table.
#[repr(C)]
pub struct GcUserdata {
    pub header: GcHeader,
    pub data: Box<dyn Any>,
    pub metatable: Option<TablePtr>,
    pub env: Option<TablePtr>,
}
