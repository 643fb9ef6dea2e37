// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! motiv8-batch: daily image generation run for motiv8.
//!
//! Runs once per boot on a dedicated GPU instance: syncs its own code,
//! checks the run authorization, turns each eligible user's selfie into a
//! personalized motivational image, emails it, and shuts the instance down.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod time_utils;
