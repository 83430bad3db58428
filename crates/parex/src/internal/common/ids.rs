use crate::define_id_type;

define_id_type!(CoreId, u32);
define_id_type!(WorkerId, u32);
define_id_type!(ActionId, u32);

// Index of an implementation within the implementation list of one core element.
define_id_type!(ImplementationId, u32);
