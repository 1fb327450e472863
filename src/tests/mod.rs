// Test modules for Peerchat
// Shared fixtures live in `support`; each other module covers one area

mod directory_tests;
mod outbound_tests;
mod rendezvous_tests;
mod support;
