mod common;
mod data;
mod eviction;
mod handshake;
mod management;
mod resumption;
mod retransmit;
