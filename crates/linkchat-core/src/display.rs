//! Display names for contacts, groups and conversations

use crate::contact::Contact;
use crate::conversation::Conversation;
use crate::identity::PubKey;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Name, else alias, else the public key.
pub fn contact_display_name(contact: &Contact) -> &str {
    non_empty(contact.name.as_deref())
        .or_else(|| non_empty(Some(contact.alias.as_str())))
        .unwrap_or_else(|| contact.pub_key.as_str())
}

fn member_display_name<'a>(pub_key: &'a PubKey, contacts: &'a [Contact]) -> &'a str {
    contacts
        .iter()
        .find(|c| &c.pub_key == pub_key)
        .map(contact_display_name)
        .unwrap_or_else(|| pub_key.short())
}

/// Members other than `me`, joined by display name.
pub fn group_default_name(member_pubs: &[PubKey], contacts: &[Contact], me: &PubKey) -> String {
    member_pubs
        .iter()
        .filter(|pub_key| *pub_key != me)
        .map(|pub_key| member_display_name(pub_key, contacts))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Label for a conversation: the contact's name for a direct chat, the group
/// name (or its member list) for a group.
pub fn conversation_label(conversation: &Conversation, contacts: &[Contact], me: &PubKey) -> String {
    if let Some(contact) = contacts
        .iter()
        .find(|c| c.pub_key == conversation.converse_pub)
    {
        return contact_display_name(contact).to_string();
    }
    if let Some(name) = non_empty(conversation.name.as_deref()) {
        return name.to_string();
    }
    match conversation.member_pubs.as_deref() {
        Some(members) if !members.is_empty() => group_default_name(members, contacts, me),
        _ => conversation.converse_pub.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use ulid::Ulid;

    fn contact(pair: &Keypair, alias: &str, name: Option<&str>) -> Contact {
        Contact {
            uuid: Ulid::new(),
            pub_key: pair.pub_key().clone(),
            epub: pair.epub().clone(),
            alias: alias.to_string(),
            name: name.map(str::to_string),
        }
    }

    #[test]
    fn test_contact_display_name_fallbacks() {
        let pair = Keypair::generate();
        assert_eq!(contact_display_name(&contact(&pair, "bob", Some("Robert"))), "Robert");
        assert_eq!(contact_display_name(&contact(&pair, "bob", Some("  "))), "bob");
        assert_eq!(
            contact_display_name(&contact(&pair, "", None)),
            pair.pub_key().as_str()
        );
    }

    #[test]
    fn test_group_default_name_skips_me() {
        let me = Keypair::generate();
        let bob = Keypair::generate();
        let carol = Keypair::generate();
        let contacts = vec![contact(&bob, "bob", None), contact(&carol, "carol", Some("Carol"))];
        let members = vec![me.pub_key().clone(), bob.pub_key().clone(), carol.pub_key().clone()];

        assert_eq!(group_default_name(&members, &contacts, me.pub_key()), "bob, Carol");
    }

    #[test]
    fn test_conversation_label_prefers_group_name() {
        let me = Keypair::generate();
        let bob = Keypair::generate();
        let group = Keypair::generate();
        let contacts = vec![contact(&bob, "bob", None)];
        let mut conversation = Conversation {
            uuid: Ulid::new(),
            converse_pub: group.pub_key().clone(),
            root_pair: group.clone(),
            next_pair: group.clone(),
            last_timestamp: 0,
            created_timestamp: 0,
            admin_pub: Some(me.pub_key().clone()),
            member_pubs: Some(vec![bob.pub_key().clone()]),
            group_pair: Some(group.clone()),
            group_timestamp: Some(0),
            name: None,
        };
        assert_eq!(conversation_label(&conversation, &contacts, me.pub_key()), "bob");

        conversation.name = Some("Garden club".into());
        assert_eq!(
            conversation_label(&conversation, &contacts, me.pub_key()),
            "Garden club"
        );
    }
}
