//! Channel naming.
//!
//! Every channel is `{application}:{purpose}:{server}`. Passing an empty
//! server name yields the prefix shared by that purpose's channels on all
//! servers, which is how a sender finds every remote channel to publish to.

const INVOCATIONS: &str = "invocations";
const GROUP_MANAGEMENT: &str = "group-management";
const ACKS: &str = "acks";

/// Derives channel names for one application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelNames {
    application_name: String,
}

impl ChannelNames {
    /// Names scoped to `application_name`.
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
        }
    }

    /// The application prefix.
    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    /// Channel carrying client invocations for `server`.
    pub fn invocations(&self, server: &str) -> String {
        self.name(INVOCATIONS, server)
    }

    /// Channel carrying group membership commands for `server`.
    pub fn group_management(&self, server: &str) -> String {
        self.name(GROUP_MANAGEMENT, server)
    }

    /// Channel carrying acknowledgments back to `server`.
    pub fn ack(&self, server: &str) -> String {
        self.name(ACKS, server)
    }

    fn name(&self, purpose: &str, server: &str) -> String {
        format!("{}:{purpose}:{server}", self.application_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_application_purpose_server() {
        let names = ChannelNames::new("chat");
        assert_eq!(names.invocations("s1"), "chat:invocations:s1");
        assert_eq!(names.group_management("s1"), "chat:group-management:s1");
        assert_eq!(names.ack("s1"), "chat:acks:s1");
    }

    #[test]
    fn empty_server_yields_purpose_prefix() {
        let names = ChannelNames::new("chat");
        let prefix = names.invocations("");
        assert_eq!(prefix, "chat:invocations:");
        assert!(names.invocations("s2").starts_with(&prefix));
        assert!(!names.group_management("s2").starts_with(&prefix));
        assert!(!names.ack("s2").starts_with(&prefix));
    }

    #[test]
    fn applications_do_not_share_prefixes() {
        let a = ChannelNames::new("a");
        let b = ChannelNames::new("b");
        assert!(!b.invocations("s1").starts_with(&a.invocations("")));
    }
}
