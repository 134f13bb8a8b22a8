mod fixtures;

mod client_mode;
mod events;
mod failure;
mod join;
