//! nydus-commit CLI - commit running containers into accelerated images.

pub mod commands;
