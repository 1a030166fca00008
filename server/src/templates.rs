use minijinja::{context, Environment};

use crate::types::{ChannelOrigin, Contact};

const STAFF_NOTIFICATION_TEMPLATE: &str = include_str!("templates/staff_notification.j2");
const STAFF_MIRROR_TEMPLATE: &str = include_str!("templates/staff_mirror.j2");

pub struct StaffNotificationContext<'a> {
    pub conversation_id: &'a str,
    pub contact: &'a Contact,
    pub channel: ChannelOrigin,
    pub body: &'a str,
}

pub struct StaffMirrorContext<'a> {
    pub contact: &'a Contact,
    pub author: Option<&'a str>,
    pub channel: ChannelOrigin,
    pub body: &'a str,
}

fn channel_label(channel: ChannelOrigin) -> &'static str {
    match channel {
        ChannelOrigin::Web => "web chat",
        ChannelOrigin::Telegram => "Telegram",
        ChannelOrigin::WhatsApp => "WhatsApp",
        ChannelOrigin::AdminConsole => "admin console",
    }
}

fn contact_details(contact: &Contact) -> String {
    [contact.email.as_deref(), contact.phone.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" · ")
}

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    env.get_template(name).ok()?.render(ctx).ok()
}

/// Text announced to staff chats when a customer writes in.
pub fn render_staff_notification(ctx: &StaffNotificationContext<'_>) -> String {
    render(
        "staff_notification",
        STAFF_NOTIFICATION_TEMPLATE,
        context! {
            customer => ctx.contact.display_name(),
            contact_details => contact_details(ctx.contact),
            channel => channel_label(ctx.channel),
            body => ctx.body,
            conversation_id => ctx.conversation_id,
        },
    )
    .unwrap_or_else(|| fallback_staff_notification(ctx))
}

fn fallback_staff_notification(ctx: &StaffNotificationContext<'_>) -> String {
    format!(
        "New message from {} via {}:\n{}\n\nReply with: /reply {} <your message>",
        ctx.contact.display_name(),
        channel_label(ctx.channel),
        ctx.body,
        ctx.conversation_id
    )
}

/// Copy of a staff reply for staff chats on the other platforms.
pub fn render_staff_mirror(ctx: &StaffMirrorContext<'_>) -> String {
    render(
        "staff_mirror",
        STAFF_MIRROR_TEMPLATE,
        context! {
            author => ctx.author.filter(|a| !a.trim().is_empty()).unwrap_or("Staff"),
            customer => ctx.contact.display_name(),
            channel => channel_label(ctx.channel),
            body => ctx.body,
        },
    )
    .unwrap_or_else(|| {
        format!(
            "{} replied to {}: {}",
            ctx.author.unwrap_or("Staff"),
            ctx.contact.display_name(),
            ctx.body
        )
    })
}
