mod closure;
mod number;
mod userdata;
mod value;

pub use closure::{CClosure, ClosureKind, GcClosure, GcUpval, LClosure, Proto, UpvalState};
pub use number::{fb2int, int2fb, num_to_buf, str_to_num};
pub use userdata::GcUserdata;
pub use value::*;
