mod entity;
mod permissions;

pub use entity::Attributes;
pub use entity::FileSystemObject;
pub use entity::ParentDirectory;
pub use entity::Symlink;
pub use entity::USER_ROOT;
pub use permissions::PermissionBits;
pub use permissions::Permissions;
