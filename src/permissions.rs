use bitflags::bitflags;

bitflags! {
    /// Channel permission bits as computed by the API and carried in the join token.
    /// Only the bits the SFU acts on are named; unknown bits are preserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u64 {
        const ADMINISTRATOR  = 1 << 3;
        const STREAM         = 1 << 9;
        const CONNECT        = 1 << 20;
        const SPEAK          = 1 << 21;
        const MUTE_MEMBERS   = 1 << 22;
        const DEAFEN_MEMBERS = 1 << 23;
        const MOVE_MEMBERS   = 1 << 24;

        const _ = !0;
    }
}

impl Permissions {
    /// Capabilities granted to a user that an administrator force-moved into a channel.
    pub const MOVED_OVERRIDE: Permissions = Permissions::CONNECT
        .union(Permissions::SPEAK)
        .union(Permissions::STREAM);

    /// `ADMINISTRATOR` implies every other bit.
    pub fn allows(&self, required: Permissions) -> bool {
        self.contains(Permissions::ADMINISTRATOR) || self.contains(required)
    }

    /// Effective permissions for a join: the token's bitmask, widened when the user was moved.
    pub fn for_join(bits: u64, moved: bool) -> Permissions {
        let permissions = Permissions::from_bits_retain(bits);
        if moved {
            permissions | Permissions::MOVED_OVERRIDE
        } else {
            permissions
        }
    }
}
