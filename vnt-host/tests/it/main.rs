mod iface;
mod services;
