/// Failures of user-initiated actions, shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoardError {
    #[error("sign in required")]
    NotSignedIn,
    #[error("title and content are required")]
    EmptyTitleOrContent,
    #[error("comment is empty")]
    EmptyComment,
    #[error("nickname is empty")]
    EmptyNickname,
    #[error("post {0} not found")]
    PostNotFound(String),
    #[error("post {0} belongs to another user")]
    NotOwner(String),
}
