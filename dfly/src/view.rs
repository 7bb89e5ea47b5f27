use comfy_table::Table;
use dfly_store::{Image, Instance, Status, Volume};
use dfly_vm::port_forwards;
use std::time::{Duration, SystemTime};

fn table<const N: usize>(header: [&str; N]) -> Table {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(header);
    for column in table.column_iter_mut() {
        column.set_padding((0, 2));
    }
    table
}

/// Largest unit only, e.g. `3h` for 3h 20m 5s.
pub fn short_duration(duration: Duration) -> String {
    let whole = Duration::from_secs(duration.as_secs());
    let formatted = humantime::format_duration(whole).to_string();
    formatted
        .split_whitespace()
        .next()
        .unwrap_or("0s")
        .to_owned()
}

fn since(now: SystemTime, then: SystemTime) -> String {
    short_duration(now.duration_since(then).unwrap_or_default())
}

pub fn status_text(instance: &Instance, now: SystemTime) -> String {
    match instance.status {
        Status::Running => format!("Up {}", since(now, instance.updated_at)),
        Status::Starting => "Starting".to_owned(),
        Status::Stopped => format!("Exited {} ago", since(now, instance.updated_at)),
    }
}

/// `8080->80, 2222->22`
pub fn ports_text(port_forward: Option<&str>) -> String {
    let pairs = port_forwards(port_forward.unwrap_or_default());
    if pairs.is_empty() {
        return "-".to_owned();
    }
    pairs
        .iter()
        .map(|(host, guest)| format!("{host}->{guest}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn instances_table(instances: &[Instance], now: SystemTime) -> Table {
    let mut table = table([
        "NAME", "VCPU", "MEMORY", "STATUS", "PID", "BRIDGE", "PORTS", "CREATED",
    ]);

    for instance in instances {
        let pid = match (instance.status.is_active(), instance.pid) {
            (true, Some(pid)) => pid.to_string(),
            _ => "-".to_owned(),
        };
        table.add_row([
            instance.name.clone(),
            instance.cpus.to_string(),
            instance.memory.clone(),
            status_text(instance, now),
            pid,
            instance.bridge.clone().unwrap_or_else(|| "-".to_owned()),
            ports_text(instance.port_forward.as_deref()),
            format!("{} ago", since(now, instance.created_at)),
        ]);
    }

    table
}

pub fn images_table(images: &[Image], now: SystemTime) -> Table {
    let mut table = table(["NAME", "FORMAT", "PATH", "CREATED"]);
    for image in images {
        table.add_row([
            image.name.clone(),
            image.format.clone(),
            image.path.display().to_string(),
            format!("{} ago", since(now, image.created_at)),
        ]);
    }
    table
}

pub fn volumes_table(volumes: &[Volume], images: &[Image], now: SystemTime) -> Table {
    let mut table = table(["NAME", "IMAGE", "SIZE", "PATH", "CREATED"]);
    for volume in volumes {
        let image = images
            .iter()
            .find(|image| image.id == volume.base_image_id)
            .map(|image| image.name.clone())
            .unwrap_or_else(|| volume.base_image_id.clone());
        table.add_row([
            volume.name.clone(),
            image,
            volume.size.clone().unwrap_or_else(|| "-".to_owned()),
            volume.path.display().to_string(),
            format!("{} ago", since(now, volume.created_at)),
        ]);
    }
    table
}
