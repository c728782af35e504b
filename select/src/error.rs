//! Error taxonomy for the choke-group scheduler (spec.md §4.J), grounded on
//! `bip_select::error`'s `error_chain!` shape.

error_chain! {
    types {
        SelectError, SelectErrorKind, SelectResultExt, SelectResult;
    }

    errors {
        UnknownGroup(id: u64) {
            description("choke group id is not registered")
            display("unknown choke group {}", id)
        }
        UnknownEntry(id: u64) {
            description("peer id has no group-entry in this queue")
            display("peer {} has no group-entry in this queue", id)
        }
        AlreadyRegistered(id: u64) {
            description("peer id is already a member of this group")
            display("peer {} is already a member of this group", id)
        }
    }
}
