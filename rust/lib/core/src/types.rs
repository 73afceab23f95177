/// Generate a new random ID (UUIDv4, no dashes).
///
/// 122 random bits; collisions are not a practical concern.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
