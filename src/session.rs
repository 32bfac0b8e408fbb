use tower_sessions::Session;
use uuid::Uuid;

use crate::{store::{ChatStore, UserRecord}, AppResult};

pub const USER_ID: &str = "user_id";

/// Resolves the cookie session back to a user row. `None` means no usable
/// session; handlers turn that into a 401.
pub(crate) async fn current_user(
    store: &dyn ChatStore,
    session: &Session,
) -> AppResult<Option<UserRecord>> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Ok(None);
    };
    let user_id = Uuid::parse_str(&user_id)?;
    Ok(store.get_user(user_id).await?)
}
