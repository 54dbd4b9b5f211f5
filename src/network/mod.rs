//! Network subsystem for the TCP audio transport

pub mod bind;
pub mod tcp;

pub use bind::{listen_receiver, ConnectionAttempt};
pub use tcp::{
    connect_sender, connect_sender_with, Connection, ConnectionCloser, Listener, ListenerCloser,
};
