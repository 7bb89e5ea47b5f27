use std::fmt::Write;

/// Splits `host:guest,host:guest` into pairs, in input order.
///
/// Nothing is validated: a pair without `:` gets an empty guest port and an empty
/// segment an empty pair. Only an empty string means no forwards at all.
pub fn port_forwards(spec: &str) -> Vec<(String, String)> {
    if spec.is_empty() {
        return Vec::new();
    }
    spec.split(',')
        .map(|pair| {
            let mut ports = pair.split(':');
            let host = ports.next().unwrap_or_default();
            let guest = ports.next().unwrap_or_default();
            (host.to_owned(), guest.to_owned())
        })
        .collect()
}

/// The `-netdev` value: a bridge when one is given, otherwise user-mode NAT with
/// one `hostfwd` per forwarded port.
pub fn netdev_arg(port_forward: Option<&str>, bridge: Option<&str>) -> String {
    if let Some(bridge) = bridge {
        return format!("bridge,id=net0,br={bridge}");
    }

    let forwards = port_forwards(port_forward.unwrap_or_default());
    forwards
        .iter()
        .fold(String::from("user,id=net0"), |mut arg, (host, guest)| {
            let _ = write!(arg, ",hostfwd=tcp::{host}-:{guest}");
            arg
        })
}
