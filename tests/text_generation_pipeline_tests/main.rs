// Offline integration tests for the text generation pipeline, driven by a
// scripted mock model.

mod basic_text_generation;
mod function_calling;
mod mock;
